// This module contains the server-side request handling.
//
// The dispatcher waits for a datagram on the listening socket and routes it
// by opcode: a read request streams a file out under a retransmission
// timer, a write request receives one reactively, anything else is turned
// away with an error packet. The server keeps its listening port as its
// transfer identifier for its whole lifetime, so exactly one transaction
// runs at a time and the dispatcher blocks until it has ended.
//
// The sender side of a transaction owns the timing: it measures round
// trips on first acknowledgements, re-sends the outstanding block when the
// deadline passes, and gives up once the retransmission budget is spent.
// The receiver side has no timer of its own; the peer's retransmissions
// drive it, and its receive waits are merely bounded so a vanished client
// cannot park the server forever.

use std::io;
use std::net::SocketAddr;

use tokio::time::Instant;

use crate::store::FileStore;
use crate::tftp::{ErrorCode, Packet, SocketError, TftpResult, TftpSocket, TransferMode};
use crate::timer::{RetransmitTimer, MAX_RETRANSMISSIONS, TIMEOUT_MAX};
use crate::transfer::{ReadTransfer, ResultAction, WriteTransfer};

/// The well-known TFTP port.
pub const DEFAULT_PORT: u16 = 69;

async fn send_error_packet(
    sock: &mut TftpSocket,
    dst: SocketAddr,
    code: ErrorCode,
    message: &str,
) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock
        .send(
            &Packet::Error {
                code,
                message: message.to_string(),
            },
            dst,
        )
        .await;
}

/// A TFTP server handling one transaction at a time over a single socket.
pub struct TftpServer<S> {
    sock: TftpSocket,
    store: S,
}

impl<S: FileStore> TftpServer<S> {
    pub fn bind(addr: SocketAddr, store: S) -> TftpResult<TftpServer<S>> {
        Ok(TftpServer {
            sock: TftpSocket::bind(addr)?,
            store,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        self.sock.local_addr()
    }

    /// Serves requests until dropped. Transport hiccups are logged and the
    /// server keeps listening.
    pub async fn run(&mut self) {
        loop {
            if let Err(e) = self.serve_one().await {
                log::warn!("Transaction failed: {e}");
            }
        }
    }

    /// Accepts the next request datagram and runs the transaction it opens
    /// to completion. Blocks until the transaction has ended, one way or
    /// the other.
    pub async fn serve_one(&mut self) -> TftpResult<()> {
        let (packet, peer) = match self.sock.recv().await {
            Ok(received) => received,
            Err(SocketError::Malformed { src, reason }) => {
                log::warn!("Undecodable initial request from {src}: {reason}");
                send_error_packet(&mut self.sock, src, ErrorCode::IllegalOperation, "illegal tftp operation")
                    .await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match packet {
            Packet::Rrq { filename, mode } => self.handle_read(peer, &filename, mode).await,
            Packet::Wrq { filename, mode } => self.handle_write(peer, &filename, mode).await,
            other => {
                log::warn!("Initial request from {peer} is not RRQ or WRQ: {other:#?}");
                send_error_packet(&mut self.sock, peer, ErrorCode::IllegalOperation, "illegal tftp operation")
                    .await;
                Ok(())
            }
        }
    }

    async fn handle_read(&mut self, peer: SocketAddr, path: &str, mode: TransferMode) -> TftpResult<()> {
        log::info!("Read request from {peer} for {path:?} ({mode:?})");

        let reader = match self.store.open_read(path).await {
            Ok(reader) => reader,
            Err(e) => {
                let (code, message) = match e.kind() {
                    io::ErrorKind::NotFound => (ErrorCode::FileNotFound, "file not found"),
                    _ => (ErrorCode::AccessViolation, "access violation"),
                };
                log::warn!("Cannot open {path:?} for reading: {e}");
                send_error_packet(&mut self.sock, peer, code, message).await;
                return Ok(());
            }
        };

        let mut xfer = ReadTransfer::new(reader, mode);
        let mut out_packet = match xfer.first_packet().await {
            ResultAction::SendPacketAndAwait(p) => p,
            ResultAction::TerminateWithPacket(p) => {
                let _ = self.sock.send(&p, peer).await;
                return Ok(());
            }
            // Building the first block can only yield a packet to send.
            ResultAction::CloseConnection(_) | ResultAction::RetryRecv => return Ok(()),
        };

        let mut timer = RetransmitTimer::new();
        let mut blocks_sent: u32 = 1;
        let mut resends: u32 = 0;
        self.sock.send(&out_packet, peer).await?;
        let mut sent_at = Instant::now();

        loop {
            let remaining = timer.timeout().saturating_sub(sent_at.elapsed());
            match self.sock.recv_deadline(remaining).await {
                Ok((packet, src)) => {
                    // A third party knocking mid-transaction is turned away
                    // without disturbing the transfer.
                    if src != peer {
                        log::warn!("Packet from unknown transfer id {src} during transaction with {peer}");
                        send_error_packet(
                            &mut self.sock,
                            src,
                            ErrorCode::UnknownTransferId,
                            "unknown transfer id",
                        )
                        .await;
                        continue;
                    }

                    match xfer.process_ack(&packet).await {
                        ResultAction::SendPacketAndAwait(p) => {
                            // The block was acknowledged: fold its round trip
                            // into the estimate and move on to the next one.
                            timer.record_sample(sent_at.elapsed());
                            timer.start_block();
                            out_packet = p;
                            self.sock.send(&out_packet, peer).await?;
                            sent_at = Instant::now();
                            blocks_sent += 1;
                        }
                        ResultAction::CloseConnection(maybe_warn) => {
                            if let Some(msg) = maybe_warn {
                                log::warn!("{msg}");
                            }
                            timer.record_sample(sent_at.elapsed());
                            log::info!(
                                "Read transfer with {peer} complete: {blocks_sent} blocks, {resends} re-sent"
                            );
                            return Ok(());
                        }
                        ResultAction::RetryRecv => continue,
                        ResultAction::TerminateWithPacket(p) => {
                            let _ = self.sock.send(&p, peer).await;
                            return Ok(());
                        }
                    }
                }
                Err(SocketError::TimedOut(_)) => {
                    // Re-send the block exactly as last sent; the deadline
                    // doubles and ACK timing for this block is written off.
                    self.sock.send(&out_packet, peer).await?;
                    sent_at = Instant::now();
                    timer.back_off();
                    resends += 1;
                    log::debug!(
                        "Timeout waiting on {peer}; re-sent block ({} of {MAX_RETRANSMISSIONS})",
                        timer.retransmissions()
                    );
                    if timer.exhausted() {
                        log::warn!("Retransmission budget for {peer} exhausted, giving up");
                        send_error_packet(&mut self.sock, peer, ErrorCode::NotDefined, "timeout on send")
                            .await;
                        return Ok(());
                    }
                }
                Err(SocketError::Malformed { src, reason }) => {
                    // Undecodable noise mid-transaction is dropped so a lost
                    // ACK retransmission cannot derail the session.
                    log::debug!("Ignoring malformed packet from {src}: {reason}");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn handle_write(&mut self, peer: SocketAddr, path: &str, mode: TransferMode) -> TftpResult<()> {
        log::info!("Write request from {peer} for {path:?} ({mode:?})");

        if self.store.exists(path).await {
            log::warn!("Write request for {path:?}, which already exists");
            send_error_packet(
                &mut self.sock,
                peer,
                ErrorCode::FileAlreadyExists,
                "file already exists",
            )
            .await;
            return Ok(());
        }

        let writer = match self.store.open_create_write(path).await {
            Ok(writer) => writer,
            Err(e) => {
                log::warn!("Cannot create {path:?}: {e}");
                send_error_packet(&mut self.sock, peer, ErrorCode::AccessViolation, "access violation")
                    .await;
                return Ok(());
            }
        };

        let mut xfer = WriteTransfer::new(writer);
        self.sock.send(&xfer.first_packet(), peer).await?;

        loop {
            match self.sock.recv_deadline(TIMEOUT_MAX).await {
                Ok((packet, src)) => {
                    if src != peer {
                        log::warn!("Packet from unknown transfer id {src} during transaction with {peer}");
                        send_error_packet(
                            &mut self.sock,
                            src,
                            ErrorCode::UnknownTransferId,
                            "unknown transfer id",
                        )
                        .await;
                        continue;
                    }

                    match xfer.process_data(&packet).await {
                        ResultAction::SendPacketAndAwait(p) => {
                            self.sock.send(&p, peer).await?;
                        }
                        ResultAction::TerminateWithPacket(p) => {
                            let _ = self.sock.send(&p, peer).await;
                            log::info!("Write transfer with {peer} complete");
                            return Ok(());
                        }
                        ResultAction::RetryRecv => continue,
                        ResultAction::CloseConnection(maybe_warn) => {
                            if let Some(msg) = maybe_warn {
                                log::warn!("{msg}");
                            }
                            return Ok(());
                        }
                    }
                }
                Err(SocketError::TimedOut(_)) => {
                    log::warn!("Client {peer} went silent mid-write, giving up");
                    send_error_packet(&mut self.sock, peer, ErrorCode::NotDefined, "timeout on receive")
                        .await;
                    return Ok(());
                }
                Err(SocketError::Malformed { src, reason }) => {
                    log::debug!("Ignoring malformed packet from {src}: {reason}");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::MemStore;
    use crate::store::DirStore;
    use crate::tftp::BLOCK_SIZE;
    use async_io::Async;
    use std::net::{Ipv4Addr, UdpSocket};
    use std::time::Duration;
    use tempdir::TempDir;
    use tokio::time::timeout;

    const RECV_DEADLINE: Duration = Duration::from_secs(5);

    /// A bare-bones client speaking from its own ephemeral port.
    struct TestClient {
        sock: Async<UdpSocket>,
        server: SocketAddr,
    }

    impl TestClient {
        fn new(server: SocketAddr) -> TestClient {
            TestClient {
                sock: Async::<UdpSocket>::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap(),
                server,
            }
        }

        async fn send(&self, packet: &Packet) {
            self.sock.send_to(&packet.encode(), self.server).await.unwrap();
        }

        async fn send_raw(&self, bytes: &[u8]) {
            self.sock.send_to(bytes, self.server).await.unwrap();
        }

        async fn recv(&self) -> Packet {
            let mut buf = [0_u8; 1024];
            let (n, src) = timeout(RECV_DEADLINE, self.sock.recv_from(&mut buf))
                .await
                .expect("no reply from server")
                .unwrap();
            assert_eq!(src, self.server);
            Packet::decode(&buf[..n]).unwrap()
        }
    }

    fn bind_server<S: FileStore>(store: S) -> (TftpServer<S>, SocketAddr) {
        let server = TftpServer::bind((Ipv4Addr::LOCALHOST, 0).into(), store).unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    /// Drives a full RRQ download, returning the reassembled bytes.
    async fn download(client: &TestClient, path: &str, mode: TransferMode) -> Vec<u8> {
        client
            .send(&Packet::Rrq {
                filename: path.to_string(),
                mode,
            })
            .await;

        let mut got = Vec::new();
        let mut expect_block = 1_u16;
        loop {
            match client.recv().await {
                Packet::Data { block, payload } => {
                    assert_eq!(block, expect_block);
                    let len = payload.len();
                    got.extend_from_slice(&payload);
                    client.send(&Packet::Ack { block }).await;
                    if len < BLOCK_SIZE {
                        return got;
                    }
                    expect_block += 1;
                }
                other => panic!("expected DATA, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_octet_read_round_trip() {
        let store = MemStore::new();
        let contents: Vec<u8> = (0..700_u32).map(|i| i as u8).collect();
        store.insert("file.bin", contents.clone());
        let (mut server, addr) = bind_server(store);
        let client = TestClient::new(addr);

        let (served, got) = tokio::join!(
            server.serve_one(),
            download(&client, "file.bin", TransferMode::Octet)
        );
        served.unwrap();
        assert_eq!(got, contents);
    }

    #[tokio::test]
    async fn test_block_aligned_read_ends_with_empty_block() {
        let store = MemStore::new();
        store.insert("aligned.bin", vec![0x41; 2 * BLOCK_SIZE]);
        let (mut server, addr) = bind_server(store);
        let client = TestClient::new(addr);

        let (served, got) = tokio::join!(
            server.serve_one(),
            download(&client, "aligned.bin", TransferMode::Octet)
        );
        served.unwrap();
        assert_eq!(got, vec![0x41; 2 * BLOCK_SIZE]);
    }

    #[tokio::test]
    async fn test_netascii_read_expands_line_endings() {
        let store = MemStore::new();
        store.insert("lines.txt", b"one\ntwo\r".to_vec());
        let (mut server, addr) = bind_server(store);
        let client = TestClient::new(addr);

        let (served, got) = tokio::join!(
            server.serve_one(),
            download(&client, "lines.txt", TransferMode::Netascii)
        );
        served.unwrap();
        assert_eq!(got, b"one\r\ntwo\r\0");
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let (mut server, addr) = bind_server(MemStore::new());
        let client = TestClient::new(addr);

        let client_side = async {
            client
                .send(&Packet::Rrq {
                    filename: "nope.bin".to_string(),
                    mode: TransferMode::Octet,
                })
                .await;
            client.recv().await
        };

        let (served, reply) = tokio::join!(server.serve_one(), client_side);
        served.unwrap();
        assert_eq!(
            reply,
            Packet::Error {
                code: ErrorCode::FileNotFound,
                message: "file not found".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_write_creates_file() {
        let store = MemStore::new();
        let (mut server, addr) = bind_server(store.clone());
        let client = TestClient::new(addr);

        let client_side = async {
            client
                .send(&Packet::Wrq {
                    filename: "new.bin".to_string(),
                    mode: TransferMode::Octet,
                })
                .await;
            assert_eq!(client.recv().await, Packet::Ack { block: 0 });

            client
                .send(&Packet::Data {
                    block: 1,
                    payload: b"0123456789".to_vec(),
                })
                .await;
            assert_eq!(client.recv().await, Packet::Ack { block: 1 });
        };

        let (served, ()) = tokio::join!(server.serve_one(), client_side);
        served.unwrap();
        assert_eq!(store.contents("new.bin").unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_write_existing_file_refused() {
        let store = MemStore::new();
        store.insert("existing.txt", b"taken".to_vec());
        let (mut server, addr) = bind_server(store.clone());
        let client = TestClient::new(addr);

        let client_side = async {
            client
                .send(&Packet::Wrq {
                    filename: "existing.txt".to_string(),
                    mode: TransferMode::Octet,
                })
                .await;
            client.recv().await
        };

        let (served, reply) = tokio::join!(server.serve_one(), client_side);
        served.unwrap();
        assert_eq!(
            reply,
            Packet::Error {
                code: ErrorCode::FileAlreadyExists,
                message: "file already exists".to_string()
            }
        );
        assert_eq!(store.contents("existing.txt").unwrap(), b"taken");
    }

    #[tokio::test]
    async fn test_write_to_disk_via_dir_store() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let (mut server, addr) = bind_server(DirStore::new(tmpdir.path()));
        let client = TestClient::new(addr);

        let client_side = async {
            client
                .send(&Packet::Wrq {
                    filename: "/upload.bin".to_string(),
                    mode: TransferMode::Octet,
                })
                .await;
            assert_eq!(client.recv().await, Packet::Ack { block: 0 });

            client
                .send(&Packet::Data {
                    block: 1,
                    payload: vec![0x55; BLOCK_SIZE],
                })
                .await;
            assert_eq!(client.recv().await, Packet::Ack { block: 1 });

            client
                .send(&Packet::Data {
                    block: 2,
                    payload: b"end".to_vec(),
                })
                .await;
            assert_eq!(client.recv().await, Packet::Ack { block: 2 });
        };

        let (served, ()) = tokio::join!(server.serve_one(), client_side);
        served.unwrap();

        let written = std::fs::read(tmpdir.path().join("upload.bin")).unwrap();
        let mut want = vec![0x55; BLOCK_SIZE];
        want.extend_from_slice(b"end");
        assert_eq!(written, want);
    }

    #[tokio::test]
    async fn test_initial_packet_must_be_a_request() {
        let (mut server, addr) = bind_server(MemStore::new());
        let client = TestClient::new(addr);

        let client_side = async {
            client.send(&Packet::Ack { block: 1 }).await;
            client.recv().await
        };

        let (served, reply) = tokio::join!(server.serve_one(), client_side);
        served.unwrap();
        assert_eq!(
            reply,
            Packet::Error {
                code: ErrorCode::IllegalOperation,
                message: "illegal tftp operation".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_initial_packet_answered_with_error() {
        let (mut server, addr) = bind_server(MemStore::new());
        let client = TestClient::new(addr);

        let client_side = async {
            client.send_raw(&[0x00, 0x09, 0xAA, 0xBB]).await;
            client.recv().await
        };

        let (served, reply) = tokio::join!(server.serve_one(), client_side);
        served.unwrap();
        assert_eq!(
            reply,
            Packet::Error {
                code: ErrorCode::IllegalOperation,
                message: "illegal tftp operation".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_third_party_gets_unknown_tid_and_transfer_survives() {
        let store = MemStore::new();
        store.insert("file.bin", vec![0x42; 700]);
        let (mut server, addr) = bind_server(store);
        let client = TestClient::new(addr);

        let client_side = async {
            client
                .send(&Packet::Rrq {
                    filename: "file.bin".to_string(),
                    mode: TransferMode::Octet,
                })
                .await;
            let first = client.recv().await;
            assert_eq!(
                first,
                Packet::Data {
                    block: 1,
                    payload: vec![0x42; BLOCK_SIZE]
                }
            );

            // An interloper barges in from a different port mid-transfer.
            let intruder = TestClient::new(addr);
            intruder.send(&Packet::Ack { block: 1 }).await;
            assert_eq!(
                intruder.recv().await,
                Packet::Error {
                    code: ErrorCode::UnknownTransferId,
                    message: "unknown transfer id".to_string()
                }
            );

            // The real transfer carries on undisturbed.
            client.send(&Packet::Ack { block: 1 }).await;
            assert_eq!(
                client.recv().await,
                Packet::Data {
                    block: 2,
                    payload: vec![0x42; 700 - BLOCK_SIZE]
                }
            );
            client.send(&Packet::Ack { block: 2 }).await;
        };

        let (served, ()) = tokio::join!(server.serve_one(), client_side);
        served.unwrap();
    }

    #[tokio::test]
    async fn test_withheld_ack_triggers_identical_resend() {
        let store = MemStore::new();
        store.insert("file.bin", b"payload".to_vec());
        let (mut server, addr) = bind_server(store);
        let client = TestClient::new(addr);

        let client_side = async {
            client
                .send(&Packet::Rrq {
                    filename: "file.bin".to_string(),
                    mode: TransferMode::Octet,
                })
                .await;

            // Withhold the ACK: the server must re-send the same DATA.
            let first = client.recv().await;
            let second = client.recv().await;
            assert_eq!(first, second);
            assert_eq!(
                first,
                Packet::Data {
                    block: 1,
                    payload: b"payload".to_vec()
                }
            );

            client.send(&Packet::Ack { block: 1 }).await;
        };

        let (served, ()) = tokio::join!(server.serve_one(), client_side);
        served.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_ack_not_answered_with_resend() {
        let store = MemStore::new();
        store.insert("file.bin", vec![0x42; 700]);
        let (mut server, addr) = bind_server(store);
        let client = TestClient::new(addr);

        let client_side = async {
            client
                .send(&Packet::Rrq {
                    filename: "file.bin".to_string(),
                    mode: TransferMode::Octet,
                })
                .await;
            let _ = client.recv().await;

            // Two copies of the same ACK; only one DATA(2) may come back
            // before the final ACK ends the session.
            client.send(&Packet::Ack { block: 1 }).await;
            client.send(&Packet::Ack { block: 1 }).await;

            let next = client.recv().await;
            assert_eq!(
                next,
                Packet::Data {
                    block: 2,
                    payload: vec![0x42; 700 - BLOCK_SIZE]
                }
            );
            client.send(&Packet::Ack { block: 2 }).await;

            // Nothing further: the duplicate ACK must not have produced a
            // second DATA(2).
            let extra = timeout(Duration::from_millis(300), async {
                let mut buf = [0_u8; 1024];
                client.sock.recv_from(&mut buf).await.unwrap();
            })
            .await;
            assert!(extra.is_err(), "server re-sent in response to duplicate ACK");
        };

        let (served, ()) = tokio::join!(server.serve_one(), client_side);
        served.unwrap();
    }
}
