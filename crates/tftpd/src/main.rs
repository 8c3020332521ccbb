//! tftpd - Main executable
//!
//! Serves a single directory over TFTP.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use tftp::{TftpServer, TftpServerConfig, TransferConfig};
use tracing_subscriber::EnvFilter;

const DEFAULT_FOLDER: &str = ".";
const DEFAULT_PORT: u16 = 69;
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(FromArgs, Debug)]
#[argh(
    description = "TFTP server - serves and receives files over RFC 1350 TFTP",
    example = "Serve the current directory on the standard port (needs root):\n  {command_name}",
    example = "Serve ./boot on an unprivileged port:\n  {command_name} --folder ./boot --port 6969",
    example = "Fail silently like a minimal server, with a short timeout:\n  {command_name} --no-error-replies --timeout 1"
)]
struct CliConfig {
    #[argh(
        option,
        short = 'f',
        description = "folder to serve",
        default = "PathBuf::from(DEFAULT_FOLDER)"
    )]
    folder: PathBuf,

    #[argh(option, short = 'p', description = "udp port to listen on", default = "DEFAULT_PORT")]
    port: u16,

    #[argh(
        option,
        short = 'a',
        description = "ip address to bind",
        default = "\"0.0.0.0\".to_string()"
    )]
    address: String,

    #[argh(option, short = 't', description = "seconds to wait before retransmitting", default = "3")]
    timeout: u64,

    #[argh(
        option,
        short = 'r',
        description = "transmissions of a packet before a transfer is abandoned",
        default = "8"
    )]
    retries: usize,

    #[argh(switch, description = "never answer failed requests with a TFTP ERROR packet")]
    no_error_replies: bool,
}

impl CliConfig {
    fn into_server_config(self) -> Result<TftpServerConfig> {
        let ip: IpAddr = self
            .address
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.address))?;

        if !self.folder.is_dir() {
            anyhow::bail!("Folder to serve is not a directory: {}", self.folder.display());
        }
        if self.retries == 0 {
            anyhow::bail!("--retries must be at least 1");
        }

        Ok(TftpServerConfig {
            bind_address: std::net::SocketAddr::new(ip, self.port).to_string(),
            root_directory: self.folder.clone(),
            transfer_config: TransferConfig {
                root_dir: self.folder,
                timeout: Duration::from_secs(self.timeout),
                max_retries: self.retries,
                error_replies: !self.no_error_replies,
            },
        })
    }
}

/// `RUST_LOG` directives when set and valid, otherwise info level so the
/// banner and transfers are always visible
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

#[tokio::main]
async fn main() -> Result<()> {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(directives.as_deref()))
        .init();

    let cli_config: CliConfig = argh::from_env();
    let config = cli_config.into_server_config()?;

    let mut server = TftpServer::new(config);
    let addr = server.bind().await?;
    tracing::info!(
        "Serving files from {} on port {}",
        server.config().root_directory.display(),
        addr.port()
    );

    server.serve().await
}
