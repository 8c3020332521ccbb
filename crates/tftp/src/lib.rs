//! TFTP (Trivial File Transfer Protocol) Server
//!
//! An RFC 1350 TFTP server over UDP:
//! - Read requests (RRQ): a file is streamed to the client in 512-byte blocks
//! - Write requests (WRQ): DATA blocks are reassembled into a file
//! - Octet mode only; request options are ignored
//! - One independent transfer per client address, each in its own task
//! - Per-block timeout with retransmission and a bounded retry budget
//! - ERROR replies for refused requests and failed file operations
//! - Requests confined to the configured root directory
//!
//! # Basic Server Usage
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use tftp::TftpServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Bind and serve in one step
//!     let mut server = TftpServer::with_config("0.0.0.0:69".to_string(), PathBuf::from("/srv/tftp"));
//!     server.run().await?;
//!
//!     // Or bind first to learn the port, then serve
//!     let mut server = TftpServer::with_config("127.0.0.1:0".to_string(), PathBuf::from("./files"));
//!     let addr = server.bind().await?;
//!     println!("listening on {}", addr);
//!     server.serve().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Working with Packets
//!
//! ```rust
//! use tftp::{TftpOpcode, TftpPacket, build_request, parse_packet};
//!
//! let wire = build_request(TftpOpcode::ReadRequest, "boot.img", "octet");
//! let TftpPacket::Request(request) = parse_packet(&wire).unwrap() else {
//!     unreachable!()
//! };
//! assert_eq!(request.filename, "boot.img");
//! assert!(request.is_octet());
//! ```

mod protocol;
mod server;
mod transfer;

pub use protocol::*;
pub use server::*;
pub use transfer::*;
