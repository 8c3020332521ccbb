//! Integration tests for the TFTP server
//!
//! These tests start the actual server on a loopback port and drive it with
//! real UDP clients.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tempfile::{TempDir, tempdir};
use tftp::{
    BLOCK_SIZE, TftpAck, TftpData, TftpErrorCode, TftpOpcode, TftpPacket, TftpServer, TftpServerConfig,
    TransferConfig, build_ack, build_data, build_request, parse_packet,
};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const REPLY_WAIT: Duration = Duration::from_secs(2);
const SILENCE_WAIT: Duration = Duration::from_millis(300);

struct TestServer {
    addr: SocketAddr,
    root: TempDir,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_server(transfer_timeout: Duration) -> TestServer {
    let root = tempdir().unwrap();
    let config = TftpServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        root_directory: root.path().to_path_buf(),
        transfer_config: TransferConfig {
            timeout: transfer_timeout,
            max_retries: 4,
            ..Default::default()
        },
    };

    let mut server = TftpServer::new(config);
    let addr = server.bind().await.unwrap();
    let handle = tokio::spawn(async move { server.serve().await });

    TestServer { addr, root, handle }
}

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn recv_packet(socket: &UdpSocket) -> TftpPacket {
    let mut buf = [0u8; 2048];
    let (n, _) = timeout(REPLY_WAIT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for the server")
        .unwrap();
    parse_packet(&buf[..n]).unwrap()
}

async fn assert_silence(socket: &UdpSocket) {
    let mut buf = [0u8; 2048];
    let result = timeout(SILENCE_WAIT, socket.recv_from(&mut buf)).await;
    assert!(result.is_err(), "expected no reply, got {:?}", result);
}

async fn expect_data(socket: &UdpSocket) -> TftpData {
    match recv_packet(socket).await {
        TftpPacket::Data(data) => data,
        other => panic!("expected DATA, got {}", other),
    }
}

fn write_file(root: &Path, name: &str, content: &[u8]) {
    std::fs::write(root.join(name), content).unwrap();
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_read_exact_multiple_ends_with_empty_block() {
    let server = start_server(Duration::from_secs(3)).await;
    let content = pattern(1024);
    write_file(server.root.path(), "kernel.img", &content);

    let socket = client().await;
    socket
        .send_to(&build_request(TftpOpcode::ReadRequest, "kernel.img", "octet"), server.addr)
        .await
        .unwrap();

    let mut received = Vec::new();
    let mut sizes = Vec::new();
    for expected_block in 1..=3u16 {
        let data = expect_data(&socket).await;
        assert_eq!(data.block, expected_block);
        sizes.push(data.data.len());
        received.extend_from_slice(&data.data);
        socket.send_to(&build_ack(data.block), server.addr).await.unwrap();
    }

    assert_eq!(sizes, vec![512, 512, 0]);
    assert_eq!(received, content);
    // Transfer is over, nothing more is sent
    assert_silence(&socket).await;
}

#[tokio::test]
async fn test_read_short_file_single_block() {
    let server = start_server(Duration::from_secs(3)).await;
    write_file(server.root.path(), "hello.txt", b"Hello, TFTP!");

    let socket = client().await;
    socket
        .send_to(&build_request(TftpOpcode::ReadRequest, "hello.txt", "octet"), server.addr)
        .await
        .unwrap();

    let data = expect_data(&socket).await;
    assert_eq!(data, TftpData::new(1, b"Hello, TFTP!".to_vec()));
    socket.send_to(&build_ack(1), server.addr).await.unwrap();
    assert_silence(&socket).await;
}

#[tokio::test]
async fn test_write_reassembles_blocks_in_order() {
    let server = start_server(Duration::from_secs(3)).await;
    let socket = client().await;

    socket
        .send_to(&build_request(TftpOpcode::WriteRequest, "upload.bin", "octet"), server.addr)
        .await
        .unwrap();
    assert_eq!(recv_packet(&socket).await, TftpPacket::Ack(TftpAck::new(0)));

    let payloads = [vec![1u8; 512], vec![2u8; 512], vec![3u8; 300]];
    for (i, payload) in payloads.iter().enumerate() {
        let block = i as u16 + 1;
        socket.send_to(&build_data(block, payload), server.addr).await.unwrap();
        assert_eq!(recv_packet(&socket).await, TftpPacket::Ack(TftpAck::new(block)));
    }

    let written = std::fs::read(server.root.path().join("upload.bin")).unwrap();
    assert_eq!(written, payloads.concat());
}

#[tokio::test]
async fn test_write_request_during_write_is_ignored() {
    let server = start_server(Duration::from_secs(3)).await;
    let socket = client().await;

    socket
        .send_to(&build_request(TftpOpcode::WriteRequest, "first.bin", "octet"), server.addr)
        .await
        .unwrap();
    assert_eq!(recv_packet(&socket).await, TftpPacket::Ack(TftpAck::new(0)));

    socket
        .send_to(&build_request(TftpOpcode::WriteRequest, "second.bin", "octet"), server.addr)
        .await
        .unwrap();
    assert_silence(&socket).await;
    assert!(!server.root.path().join("second.bin").exists());

    // The original transfer carries on untouched
    socket.send_to(&build_data(1, b"still here"), server.addr).await.unwrap();
    assert_eq!(recv_packet(&socket).await, TftpPacket::Ack(TftpAck::new(1)));
    assert_eq!(
        std::fs::read(server.root.path().join("first.bin")).unwrap(),
        b"still here"
    );
}

#[tokio::test]
async fn test_mismatched_ack_neither_advances_nor_resends() {
    let server = start_server(Duration::from_secs(3)).await;
    let content = pattern(BLOCK_SIZE + 10);
    write_file(server.root.path(), "two_blocks.bin", &content);

    let socket = client().await;
    socket
        .send_to(&build_request(TftpOpcode::ReadRequest, "two_blocks.bin", "octet"), server.addr)
        .await
        .unwrap();
    assert_eq!(expect_data(&socket).await.block, 1);

    socket.send_to(&build_ack(7), server.addr).await.unwrap();
    assert_silence(&socket).await;

    socket.send_to(&build_ack(1), server.addr).await.unwrap();
    let second = expect_data(&socket).await;
    assert_eq!(second.block, 2);
    assert_eq!(second.data, &content[BLOCK_SIZE..]);
    socket.send_to(&build_ack(2), server.addr).await.unwrap();
}

#[tokio::test]
async fn test_data_without_transfer_is_dropped() {
    let server = start_server(Duration::from_secs(3)).await;
    let socket = client().await;

    socket.send_to(&build_data(1, b"orphan"), server.addr).await.unwrap();
    assert_silence(&socket).await;
    assert_eq!(std::fs::read_dir(server.root.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_missing_file_gets_error_reply() {
    let server = start_server(Duration::from_secs(3)).await;
    let socket = client().await;

    socket
        .send_to(&build_request(TftpOpcode::ReadRequest, "nope.txt", "octet"), server.addr)
        .await
        .unwrap();

    match recv_packet(&socket).await {
        TftpPacket::Error(error) => assert_eq!(error.code, TftpErrorCode::FileNotFound),
        other => panic!("expected ERROR, got {}", other),
    }
}

#[tokio::test]
async fn test_path_traversal_gets_access_violation() {
    let server = start_server(Duration::from_secs(3)).await;
    let socket = client().await;

    socket
        .send_to(&build_request(TftpOpcode::WriteRequest, "../escape.txt", "octet"), server.addr)
        .await
        .unwrap();

    match recv_packet(&socket).await {
        TftpPacket::Error(error) => assert_eq!(error.code, TftpErrorCode::AccessViolation),
        other => panic!("expected ERROR, got {}", other),
    }
    assert!(!server.root.path().join("../escape.txt").exists());
}

#[tokio::test]
async fn test_unacknowledged_block_is_retransmitted() {
    let server = start_server(Duration::from_millis(150)).await;
    write_file(server.root.path(), "retry.txt", b"retry me");

    let socket = client().await;
    socket
        .send_to(&build_request(TftpOpcode::ReadRequest, "retry.txt", "octet"), server.addr)
        .await
        .unwrap();

    let first = expect_data(&socket).await;
    let again = expect_data(&socket).await;
    assert_eq!(first, again);

    socket.send_to(&build_ack(1), server.addr).await.unwrap();
}

#[tokio::test]
async fn test_duplicate_data_is_reacked_not_rewritten() {
    let server = start_server(Duration::from_secs(3)).await;
    let socket = client().await;

    socket
        .send_to(&build_request(TftpOpcode::WriteRequest, "dup.bin", "octet"), server.addr)
        .await
        .unwrap();
    assert_eq!(recv_packet(&socket).await, TftpPacket::Ack(TftpAck::new(0)));

    let full = vec![9u8; BLOCK_SIZE];
    for _ in 0..2 {
        socket.send_to(&build_data(1, &full), server.addr).await.unwrap();
        assert_eq!(recv_packet(&socket).await, TftpPacket::Ack(TftpAck::new(1)));
    }
    socket.send_to(&build_data(2, b"end"), server.addr).await.unwrap();
    assert_eq!(recv_packet(&socket).await, TftpPacket::Ack(TftpAck::new(2)));

    let written = std::fs::read(server.root.path().join("dup.bin")).unwrap();
    assert_eq!(written.len(), BLOCK_SIZE + 3);
}

#[tokio::test]
async fn test_concurrent_reads_are_independent() {
    let server = start_server(Duration::from_secs(3)).await;
    let first_content = pattern(BLOCK_SIZE * 2 + 1);
    let second_content = vec![7u8; 100];
    write_file(server.root.path(), "a.bin", &first_content);
    write_file(server.root.path(), "b.bin", &second_content);

    let first = client().await;
    let second = client().await;
    first
        .send_to(&build_request(TftpOpcode::ReadRequest, "a.bin", "octet"), server.addr)
        .await
        .unwrap();
    second
        .send_to(&build_request(TftpOpcode::ReadRequest, "b.bin", "octet"), server.addr)
        .await
        .unwrap();

    // The second client finishes while the first is still mid-transfer
    let opening = expect_data(&first).await;
    assert_eq!(opening.block, 1);
    let only = expect_data(&second).await;
    assert_eq!(only.data, second_content);
    second.send_to(&build_ack(1), server.addr).await.unwrap();

    let mut received = opening.data;
    first.send_to(&build_ack(1), server.addr).await.unwrap();
    for block in 2..=3u16 {
        let data = expect_data(&first).await;
        assert_eq!(data.block, block);
        received.extend_from_slice(&data.data);
        first.send_to(&build_ack(block), server.addr).await.unwrap();
    }
    assert_eq!(received, first_content);
}

#[tokio::test]
async fn test_malformed_datagrams_do_not_stop_server() {
    let server = start_server(Duration::from_secs(3)).await;
    write_file(server.root.path(), "ok.txt", b"ok");
    let socket = client().await;

    for junk in [&[0x00][..], &[0x00, 0x01, b'x'], &[0x00, 0x04, 0x01], &[0x00, 0x09, 0x00, 0x00]] {
        socket.send_to(junk, server.addr).await.unwrap();
    }
    assert_silence(&socket).await;

    socket
        .send_to(&build_request(TftpOpcode::ReadRequest, "ok.txt", "octet"), server.addr)
        .await
        .unwrap();
    assert_eq!(expect_data(&socket).await, TftpData::new(1, b"ok".to_vec()));
    socket.send_to(&build_ack(1), server.addr).await.unwrap();
}

#[tokio::test]
async fn test_non_octet_mode_is_served_as_octet() {
    let server = start_server(Duration::from_secs(3)).await;
    write_file(server.root.path(), "lines.txt", b"a\nb\n");
    let socket = client().await;

    socket
        .send_to(&build_request(TftpOpcode::ReadRequest, "lines.txt", "netascii"), server.addr)
        .await
        .unwrap();

    // Bytes are sent untranslated
    assert_eq!(expect_data(&socket).await, TftpData::new(1, b"a\nb\n".to_vec()));
    socket.send_to(&build_ack(1), server.addr).await.unwrap();
}
