//! TFTP File Transfer Logic
//!
//! This module runs a single client's transfer: streaming a file out for a
//! read request, or reassembling one from DATA blocks for a write request.
//! Each transfer owns its file handle and block counter and receives the
//! client's packets through a [`Peer`] inbox fed by the server loop.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};

use crate::protocol::{
    BLOCK_SIZE, TftpData, TftpError, TftpErrorCode, TftpOpcode, TftpPacket, TftpRequest, build_ack, build_data,
};

const TIMEOUT_SECS: u64 = 3;
const MAX_RETRIES: usize = 8;

/// Transfer session configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub root_dir: PathBuf,
    /// How long to wait for the client before retransmitting
    pub timeout: Duration,
    /// Transmissions of one packet before the session is abandoned
    pub max_retries: usize,
    /// Send an ERROR packet when a request is refused or a file operation fails
    pub error_replies: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            timeout: Duration::from_secs(TIMEOUT_SECS),
            max_retries: MAX_RETRIES,
            error_replies: true,
        }
    }
}

/// One client as seen from inside its transfer task
///
/// Outgoing packets leave through the shared server socket; incoming packets
/// from this client arrive on `inbox`.
pub struct Peer {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    inbox: mpsc::Receiver<TftpPacket>,
    lingering: Arc<AtomicBool>,
}

impl Peer {
    pub fn new(socket: Arc<UdpSocket>, addr: SocketAddr, inbox: mpsc::Receiver<TftpPacket>) -> Self {
        Self {
            socket,
            addr,
            inbox,
            lingering: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Flag set once the transfer is complete and only waiting for
    /// retransmissions of the final block
    pub fn lingering(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.lingering)
    }

    fn mark_lingering(&self) {
        self.lingering.store(true, Ordering::Release);
    }

    /// Send a packet, logging instead of failing: a lost send is recovered
    /// by the retransmission timer like a lost datagram.
    async fn send(&self, packet: &[u8]) {
        if let Err(e) = self.socket.send_to(packet, self.addr).await {
            tracing::warn!("Failed to send {} bytes to {}: {}", packet.len(), self.addr, e);
        }
    }

    async fn send_error(&self, error: &TftpError, config: &TransferConfig) {
        if config.error_replies {
            tracing::debug!("Sending ERROR to {}: {}", self.addr, error);
            self.send(&error.to_bytes()).await;
        }
    }

    /// Wait until `deadline` for the next packet from this client.
    ///
    /// Returns `Ok(None)` on timeout.
    async fn recv_until(&mut self, deadline: Instant) -> Result<Option<TftpPacket>> {
        match timeout_at(deadline, self.inbox.recv()).await {
            Ok(Some(packet)) => Ok(Some(packet)),
            Ok(None) => Err(anyhow!("server stopped routing packets from {}", self.addr)),
            Err(_) => Ok(None),
        }
    }
}

/// Run a transfer for a freshly accepted request
pub async fn handle_request(peer: Peer, request: TftpRequest, config: &TransferConfig) -> Result<()> {
    if !request.is_octet() {
        tracing::warn!(
            "Unsupported mode '{}' requested by {}, transferring as octet",
            request.mode,
            peer.addr()
        );
    }

    match request.opcode {
        TftpOpcode::ReadRequest => handle_read_request(peer, &request.filename, config).await,
        TftpOpcode::WriteRequest => handle_write_request(peer, &request.filename, config).await,
        opcode => Err(anyhow!("{} is not a request opcode", opcode)),
    }
}

/// Handle a TFTP Read Request
pub async fn handle_read_request(mut peer: Peer, filename: &str, config: &TransferConfig) -> Result<()> {
    let file_path = match resolve_file_path(&config.root_dir, filename) {
        Ok(path) => path,
        Err(e) => {
            peer.send_error(&TftpError::access_violation(), config).await;
            return Err(e);
        }
    };

    let mut file = match File::open(&file_path).await {
        Ok(file) => file,
        Err(e) => {
            peer.send_error(&TftpError::from_io(&e), config).await;
            return Err(e).with_context(|| format!("failed to open {}", file_path.display()));
        }
    };

    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut block: u16 = 1;
    let mut total = 0usize;

    loop {
        let n = match read_block(&mut file, &mut buf).await {
            Ok(n) => n,
            Err(e) => {
                peer.send_error(&TftpError::from_io(&e), config).await;
                return Err(e).with_context(|| format!("failed to read {}", file_path.display()));
            }
        };

        let packet = build_data(block, &buf[..n]);
        send_data_block_with_retries(&mut peer, &packet, block, config).await?;
        total += n;

        // A short block (possibly empty) ends the transfer
        if n < BLOCK_SIZE {
            break;
        }
        block = block.wrapping_add(1);
    }

    tracing::info!("Sent '{}' to {} ({} bytes)", filename, peer.addr(), total);
    Ok(())
}

/// Send a data block and wait for its ACK, retransmitting on timeout
///
/// An ACK for any other block is stale or duplicated; it is ignored rather
/// than answered with a resend, so duplicates cannot multiply traffic.
async fn send_data_block_with_retries(
    peer: &mut Peer,
    packet: &[u8],
    expected_ack: u16,
    config: &TransferConfig,
) -> Result<()> {
    for attempt in 0..config.max_retries {
        if attempt > 0 {
            tracing::debug!(
                "Retransmitting DATA {} to {} (attempt {})",
                expected_ack,
                peer.addr(),
                attempt + 1
            );
        }
        peer.send(packet).await;

        let deadline = Instant::now() + config.timeout;
        while let Some(response) = peer.recv_until(deadline).await? {
            match response {
                TftpPacket::Ack(ack) if ack.block == expected_ack => return Ok(()),
                TftpPacket::Ack(ack) => {
                    tracing::debug!(
                        "Expected ACK {} from {} but got ACK {}",
                        expected_ack,
                        peer.addr(),
                        ack.block
                    );
                }
                TftpPacket::Error(error) => {
                    return Err(anyhow!("Client error: {}", error));
                }
                other => {
                    tracing::debug!("Ignoring {} from {} during read transfer", other, peer.addr());
                }
            }
        }
    }

    Err(anyhow!(
        "No ACK received for block {} after {} attempts",
        expected_ack,
        config.max_retries
    ))
}

/// Handle a TFTP Write Request
pub async fn handle_write_request(mut peer: Peer, filename: &str, config: &TransferConfig) -> Result<()> {
    let file_path = match resolve_file_path(&config.root_dir, filename) {
        Ok(path) => path,
        Err(e) => {
            peer.send_error(&TftpError::access_violation(), config).await;
            return Err(e);
        }
    };

    let mut file = match File::create(&file_path).await {
        Ok(file) => file,
        Err(e) => {
            peer.send_error(&TftpError::from_io(&e), config).await;
            return Err(e).with_context(|| format!("failed to create {}", file_path.display()));
        }
    };

    let mut last_block: u16 = 0;
    let mut ack = build_ack(last_block);
    let mut total = 0usize;
    let mut timeouts = 0usize;

    peer.send(&ack).await;

    loop {
        let deadline = Instant::now() + config.timeout;
        let Some(packet) = peer.recv_until(deadline).await? else {
            timeouts += 1;
            if timeouts >= config.max_retries {
                return Err(anyhow!(
                    "No DATA received after block {} for '{}' ({} timeouts)",
                    last_block,
                    filename,
                    timeouts
                ));
            }
            tracing::debug!("Re-sending ACK {} to {}", last_block, peer.addr());
            peer.send(&ack).await;
            continue;
        };

        match packet {
            TftpPacket::Data(data) if block_order(last_block, data.block) == BlockOrder::Next => {
                if data.data.len() > BLOCK_SIZE {
                    let error = TftpError::new(TftpErrorCode::IllegalOperation, "Block larger than 512 bytes");
                    peer.send_error(&error, config).await;
                    return Err(anyhow!("DATA {} carries {} bytes", data.block, data.data.len()));
                }

                if let Err(e) = write_block(&mut file, &data).await {
                    peer.send_error(&TftpError::from_io(&e), config).await;
                    return Err(e).with_context(|| format!("failed to write {}", file_path.display()));
                }

                total += data.data.len();
                last_block = data.block;
                ack = build_ack(last_block);
                timeouts = 0;

                if data.is_last_block() {
                    peer.mark_lingering();
                    peer.send(&ack).await;
                    tracing::info!("Received '{}' from {} ({} bytes)", filename, peer.addr(), total);
                    log_received_content(&file_path).await;
                    dally(&mut peer, last_block, &ack, config).await;
                    return Ok(());
                }
                peer.send(&ack).await;
            }
            TftpPacket::Data(data) if block_order(last_block, data.block) == BlockOrder::Repeat => {
                tracing::debug!("Duplicate DATA {} from {}, re-sending ACK", data.block, peer.addr());
                peer.send(&ack).await;
            }
            TftpPacket::Data(data) => {
                tracing::debug!(
                    "Expected DATA {} from {} but got DATA {}",
                    last_block.wrapping_add(1),
                    peer.addr(),
                    data.block
                );
            }
            TftpPacket::Error(error) => {
                return Err(anyhow!("Client error: {}", error));
            }
            other => {
                tracing::debug!("Ignoring {} from {} during write transfer", other, peer.addr());
            }
        }
    }
}

/// Where a DATA block falls relative to the last one written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockOrder {
    Next,
    Repeat,
    Unexpected,
}

/// Block numbers wrap from 65535 back to 0
fn block_order(last_block: u16, block: u16) -> BlockOrder {
    if block == last_block.wrapping_add(1) {
        BlockOrder::Next
    } else if block == last_block {
        BlockOrder::Repeat
    } else {
        BlockOrder::Unexpected
    }
}

/// Linger for one timeout after the final ACK so a client that lost it can
/// retransmit the final block and still be answered.
async fn dally(peer: &mut Peer, final_block: u16, ack: &[u8], config: &TransferConfig) {
    let deadline = Instant::now() + config.timeout;
    while let Ok(Some(packet)) = peer.recv_until(deadline).await {
        if let TftpPacket::Data(data) = packet
            && data.block == final_block
        {
            tracing::debug!("Final DATA {} repeated by {}, re-sending ACK", final_block, peer.addr());
            peer.send(ack).await;
        }
    }
}

async fn write_block(file: &mut File, data: &TftpData) -> std::io::Result<()> {
    file.write_all(&data.data).await?;
    file.flush().await
}

async fn log_received_content(path: &Path) {
    if !tracing::enabled!(tracing::Level::TRACE) {
        return;
    }
    match tokio::fs::read(path).await {
        Ok(content) => tracing::trace!("{}:\n{}", path.display(), String::from_utf8_lossy(&content)),
        Err(e) => tracing::trace!("Could not read back {}: {}", path.display(), e),
    }
}

/// Fill `buf` from `reader`, stopping early only at end of input
async fn read_block<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Resolve a requested filename under `root`, rejecting anything that would
/// escape it
fn resolve_file_path(root: impl AsRef<Path>, filename: &str) -> Result<PathBuf> {
    let root = root.as_ref();
    let relative = Path::new(filename.trim_start_matches('/'));

    let is_plain = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    let names_file = matches!(relative.components().next_back(), Some(Component::Normal(_)));
    if !is_plain || !names_file {
        return Err(anyhow!("Path traversal attempt detected: '{}'", filename));
    }

    let root_canon = root
        .canonicalize()
        .context("failed to canonicalize root directory")?;
    let requested = root.join(relative);

    // Symlinks may still point outside the root, so check whatever exists.
    // `symlink_metadata` also sees a dangling link, which then fails to
    // canonicalize: creating through it would follow it anywhere.
    let existing = if std::fs::symlink_metadata(&requested).is_ok() {
        Some(requested.as_path())
    } else {
        requested.parent().filter(|p| p.exists())
    };
    if let Some(existing) = existing {
        let canon = existing
            .canonicalize()
            .with_context(|| format!("Path traversal attempt detected: '{}'", filename))?;
        if !canon.starts_with(&root_canon) {
            return Err(anyhow!("Path traversal attempt detected: '{}'", filename));
        }
    }

    Ok(requested)
}
