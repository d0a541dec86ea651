// Packet-level state machines for the two transaction kinds.
//
// A read transfer feeds file blocks to the peer and consumes ACKs; a write
// transfer consumes DATA blocks and produces ACKs. Neither touches the
// socket: each processes one incoming packet and tells the caller what to
// do next, which keeps the lock-step protocol logic testable without UDP.
// The I/O loops that drive them (deadlines, retransmission, peer checks)
// live in the server module.

use std::io;

use crate::netascii::NetasciiEncoder;
use crate::store::{FileReader, FileWriter};
use crate::tftp::{ErrorCode, Packet, TransferMode, BLOCK_SIZE};

/// Represents an action that the caller of a transfer should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(Packet),

    /// Caller should close the connection without sending a message, optionally logging a string.
    CloseConnection(Option<String>),

    /// Caller should try receiving the last packet again.
    RetryRecv,

    /// Caller should terminate the connection by sending the packet.
    TerminateWithPacket(Packet),
}

/// Serves one file to the peer, one 512-byte block per ACK.
#[derive(Debug)]
pub struct ReadTransfer<R> {
    reader: R,
    /// Present in NETASCII mode; carries expansion state across blocks.
    encoder: Option<NetasciiEncoder>,
    curr_block: u16,
    awaiting_final_ack: bool,
}

impl<R: FileReader> ReadTransfer<R> {
    pub fn new(reader: R, mode: TransferMode) -> ReadTransfer<R> {
        ReadTransfer {
            reader,
            encoder: (mode == TransferMode::Netascii).then(NetasciiEncoder::new),
            curr_block: 0,
            awaiting_final_ack: false,
        }
    }

    /// The DATA packet that opens the transaction.
    pub async fn first_packet(&mut self) -> ResultAction {
        self.next_data().await
    }

    /// Processes a packet received while a DATA block is outstanding.
    pub async fn process_ack(&mut self, packet: &Packet) -> ResultAction {
        match packet {
            Packet::Ack { block } if *block == self.curr_block => {
                if self.awaiting_final_ack {
                    ResultAction::CloseConnection(None)
                } else {
                    self.next_data().await
                }
            }
            // Any other ACK is stale; block numbers only move forward, and
            // never re-sending an acknowledged block is what keeps the
            // sorcerer's apprentice out.
            Packet::Ack { .. } => ResultAction::RetryRecv,
            // Unexpected opcodes are ignored so a stray packet cannot
            // derail the session.
            _ => ResultAction::RetryRecv,
        }
    }

    async fn next_data(&mut self) -> ResultAction {
        let payload = match self.build_block().await {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("File read failed mid-transfer: {e}");
                return ResultAction::TerminateWithPacket(Packet::Error {
                    code: ErrorCode::AccessViolation,
                    message: "access violation".to_string(),
                });
            }
        };

        if payload.len() < BLOCK_SIZE {
            // Short block: this is the final DATA of the transfer.
            self.awaiting_final_ack = true;
        }
        self.curr_block = self.curr_block.wrapping_add(1);
        ResultAction::SendPacketAndAwait(Packet::Data {
            block: self.curr_block,
            payload,
        })
    }

    async fn build_block(&mut self) -> io::Result<Vec<u8>> {
        match &mut self.encoder {
            Some(encoder) => encoder.next_block(&mut self.reader).await,
            None => {
                let mut buf = vec![0_u8; BLOCK_SIZE];
                let n = self.reader.read(&mut buf).await?;
                buf.truncate(n);
                Ok(buf)
            }
        }
    }
}

/// Receives one file from the peer. Reactive: the peer's timer drives
/// progress, this side only answers what arrives.
#[derive(Debug)]
pub struct WriteTransfer<W> {
    writer: W,
    next_expected: u16,
}

impl<W: FileWriter> WriteTransfer<W> {
    pub fn new(writer: W) -> WriteTransfer<W> {
        WriteTransfer {
            writer,
            next_expected: 1,
        }
    }

    /// The ACK that admits the transfer.
    pub fn first_packet(&self) -> Packet {
        Packet::Ack { block: 0 }
    }

    /// Processes a packet received while a DATA block is awaited.
    pub async fn process_data(&mut self, packet: &Packet) -> ResultAction {
        match packet {
            Packet::Data { block, payload } if *block == self.next_expected => {
                if let Err(e) = self.write_block(payload).await {
                    log::warn!("File write failed mid-transfer: {e}");
                    return ResultAction::TerminateWithPacket(Packet::Error {
                        code: ErrorCode::AccessViolation,
                        message: "access violation".to_string(),
                    });
                }

                let ack = Packet::Ack {
                    block: self.next_expected,
                };
                if payload.len() < BLOCK_SIZE {
                    // Short block: the transfer ends with this ACK.
                    ResultAction::TerminateWithPacket(ack)
                } else {
                    self.next_expected = self.next_expected.wrapping_add(1);
                    ResultAction::SendPacketAndAwait(ack)
                }
            }
            // A fresh copy of the block just acknowledged means our ACK was
            // lost; repeat it, but do not write the data twice. DATA blocks
            // start at 1, so before anything has been written there is no
            // block to re-acknowledge.
            Packet::Data { block, .. }
                if self.next_expected > 1 && *block == self.next_expected - 1 =>
            {
                ResultAction::SendPacketAndAwait(Packet::Ack { block: *block })
            }
            // Any other block number is a duplicate from further back; the
            // peer will retransmit the one we expect.
            Packet::Data { .. } => ResultAction::RetryRecv,
            _ => ResultAction::RetryRecv,
        }
    }

    async fn write_block(&mut self, payload: &[u8]) -> io::Result<()> {
        self.writer.write_all(payload).await?;
        self.writer.sync().await
    }
}
