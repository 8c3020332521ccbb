//! TFTP Server Implementation
//!
//! This module contains the main TFTP server loop. It receives every datagram
//! on the listening socket, decodes it, and either starts a new transfer task
//! or routes the packet to the transfer already owned by the sender.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::protocol::{TftpPacket, TftpRequest, parse_packet};
use crate::transfer::{Peer, TransferConfig, handle_request};

/// Packets buffered per transfer before further ones are dropped
const SESSION_QUEUE_DEPTH: usize = 32;

/// TFTP Server configuration
#[derive(Debug, Clone)]
pub struct TftpServerConfig {
    pub bind_address: String,
    pub root_directory: PathBuf,
    pub transfer_config: TransferConfig,
}

impl Default for TftpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:69".to_string(),
            root_directory: PathBuf::from("."),
            transfer_config: TransferConfig::default(),
        }
    }
}

/// The server's handle on one client's transfer task
struct Session {
    tx: mpsc::Sender<TftpPacket>,
    lingering: Arc<AtomicBool>,
}

/// Main TFTP server
pub struct TftpServer {
    config: TftpServerConfig,
    socket: Option<Arc<UdpSocket>>,
    sessions: HashMap<SocketAddr, Session>,
}

impl TftpServer {
    /// Create a new TFTP server with the given configuration
    pub fn new(mut config: TftpServerConfig) -> Self {
        config.transfer_config.root_dir = config.root_directory.clone();
        Self {
            config,
            socket: None,
            sessions: HashMap::new(),
        }
    }

    /// Create a new TFTP server with default configuration
    pub fn with_defaults() -> Self {
        Self::new(TftpServerConfig::default())
    }

    /// Create a new TFTP server with custom bind address and root directory
    pub fn with_config(bind_address: String, root_directory: PathBuf) -> Self {
        Self::new(TftpServerConfig {
            bind_address,
            root_directory,
            ..Default::default()
        })
    }

    /// Get the server's configuration
    pub fn config(&self) -> &TftpServerConfig {
        &self.config
    }

    /// Get the local address the server is bound to (if bound)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Number of transfers currently in flight
    pub fn active_sessions(&self) -> usize {
        self.sessions.values().filter(|s| !s.tx.is_closed()).count()
    }

    /// Bind the listening socket and return its address
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let socket = UdpSocket::bind(&self.config.bind_address)
            .await
            .with_context(|| format!("Failed to bind TFTP server socket to {}", self.config.bind_address))?;

        let local_addr = socket.local_addr().context("Failed to get local address")?;
        tracing::info!(
            "TFTP server listening on {}, serving files from {}",
            local_addr,
            self.config.root_directory.display()
        );

        self.socket = Some(Arc::new(socket));
        Ok(local_addr)
    }

    /// Start the TFTP server and run the main loop
    pub async fn run(&mut self) -> Result<()> {
        self.bind().await?;
        self.serve().await
    }

    /// Main server loop; [`TftpServer::bind`] must have been called first
    pub async fn serve(&mut self) -> Result<()> {
        let socket = self.socket.clone().context("TFTP server socket is not bound")?;

        // Large enough for a full DATA block plus slack for oversized ones
        let mut buffer = [0u8; 2048];

        loop {
            let (len, client_addr) = match socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!("Error receiving TFTP packet: {}", e);
                    continue;
                }
            };

            match parse_packet(&buffer[..len]) {
                Ok(packet) => self.dispatch(&socket, packet, client_addr),
                Err(e) => {
                    tracing::debug!("Dropping malformed packet from {}: {}", client_addr, e);
                }
            }
        }
    }

    fn dispatch(&mut self, socket: &Arc<UdpSocket>, packet: TftpPacket, client: SocketAddr) {
        tracing::debug!("Received {} from {}", packet, client);

        match packet {
            TftpPacket::Request(request) => self.start_session(socket, request, client),
            TftpPacket::Data(_) | TftpPacket::Ack(_) | TftpPacket::Error(_) => self.route(packet, client),
            TftpPacket::Unknown(opcode) => {
                tracing::debug!("Ignoring unsupported opcode {} from {}", opcode, client);
            }
        }
    }

    /// Spawn a transfer task for a new request, unless the client already has
    /// one that is still moving data
    fn start_session(&mut self, socket: &Arc<UdpSocket>, request: TftpRequest, client: SocketAddr) {
        self.sessions.retain(|_, s| !s.tx.is_closed());

        match self.sessions.get(&client).map(|s| s.lingering.load(Ordering::Acquire)) {
            Some(false) => {
                tracing::info!(
                    "Ignoring {} for '{}' from {}: transfer already in progress",
                    request.opcode,
                    request.filename,
                    client
                );
                return;
            }
            Some(true) => {
                // Dropping the sender closes the finished transfer's inbox
                tracing::debug!("Ending finished transfer with {} for a new request", client);
                self.sessions.remove(&client);
            }
            None => {}
        }

        tracing::info!(
            "{} for '{}' in {} mode from {}",
            request.opcode,
            request.filename,
            request.mode,
            client
        );

        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let peer = Peer::new(Arc::clone(socket), client, rx);
        self.sessions.insert(
            client,
            Session {
                tx,
                lingering: peer.lingering(),
            },
        );

        let config = self.config.transfer_config.clone();
        tokio::spawn(async move {
            let filename = request.filename.clone();
            let opcode = request.opcode;
            if let Err(e) = handle_request(peer, request, &config).await {
                tracing::warn!("{} of '{}' with {} failed: {:#}", opcode, filename, client, e);
            }
        });
    }

    /// Hand a DATA/ACK/ERROR packet to the transfer owned by its sender
    fn route(&mut self, packet: TftpPacket, client: SocketAddr) {
        let Some(session) = self.sessions.get(&client) else {
            tracing::info!("Dropping {} from {}: no transfer in progress", packet, client);
            return;
        };

        match session.tx.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(packet)) => {
                tracing::debug!("Dropping {} from {}: transfer queue full", packet, client);
            }
            Err(TrySendError::Closed(packet)) => {
                self.sessions.remove(&client);
                tracing::info!("Dropping {} from {}: no transfer in progress", packet, client);
            }
        }
    }
}
