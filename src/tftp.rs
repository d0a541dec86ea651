use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Payload bytes carried by one DATA packet.
pub const BLOCK_SIZE: usize = 512;

/// Largest datagram the protocol produces: a full DATA block behind the
/// two-byte opcode and two-byte block number.
const DATAGRAM_CAPACITY: usize = BLOCK_SIZE + 4;

const OP_RRQ: u16 = 1;
const OP_WRQ: u16 = 2;
const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERROR: u16 = 5;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// A datagram that does not decode as TFTP.
#[derive(Debug, PartialEq)]
pub struct DecodeError(String);

impl DecodeError {
    fn new(reason: impl Into<String>) -> DecodeError {
        DecodeError(reason.into())
    }
}

impl error::Error for DecodeError {}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What can go wrong while exchanging packets on the socket.
#[derive(Debug)]
pub enum SocketError {
    Io(io::Error),
    /// The sender is kept alongside the reason so the caller can decide
    /// whether the offender deserves an error packet back.
    Malformed { src: SocketAddr, reason: String },
    TimedOut(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::Io(e) => write!(f, "transport failure: {e}"),
            SocketError::Malformed { src, reason } => {
                write!(f, "undecodable datagram from {src}: {reason}")
            }
            SocketError::TimedOut(_) => write!(f, "no datagram before the deadline"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::Io(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::TimedOut(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// How file bytes are represented on the wire.
///
/// `Octet` moves them untouched; `Netascii` is the network-virtual-ASCII
/// text convention with CR LF line endings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Netascii,
    Octet,
}

impl TransferMode {
    /// Matches a request's mode token, ignoring case over the whole
    /// string. Anything but the two supported tokens is refused.
    pub fn from_token(token: &str) -> Option<TransferMode> {
        if token.eq_ignore_ascii_case("netascii") {
            Some(TransferMode::Netascii)
        } else if token.eq_ignore_ascii_case("octet") {
            Some(TransferMode::Octet)
        } else {
            None
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            TransferMode::Netascii => "netascii",
            TransferMode::Octet => "octet",
        }
    }
}

/// The error taxonomy carried in ERROR packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotDefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTransferId,
    FileAlreadyExists,
    NoSuchUser,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::NotDefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTransferId => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }

    /// A peer may send a code this taxonomy does not know; those are read
    /// as the catch-all rather than rejected.
    pub fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::NotDefined,
        }
    }
}

/// One TFTP datagram, decoded.
///
/// Requests name a file and a transfer mode; DATA and ACK packets walk the
/// 16-bit block counter in lock step; ERROR carries a code from the
/// taxonomy plus a human-readable note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq {
        filename: String,
        mode: TransferMode,
    },
    Wrq {
        filename: String,
        mode: TransferMode,
    },
    Data {
        block: u16,
        payload: Vec<u8>,
    },
    Ack {
        block: u16,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Walks a datagram front to back while decoding fields off it.
struct Scanner<'a> {
    rest: &'a [u8],
}

impl<'a> Scanner<'a> {
    fn new(datagram: &'a [u8]) -> Scanner<'a> {
        Scanner { rest: datagram }
    }

    /// Takes the next big-endian 16-bit field.
    fn word(&mut self) -> Result<u16, DecodeError> {
        match self.rest {
            [hi, lo, tail @ ..] => {
                let value = u16::from_be_bytes([*hi, *lo]);
                self.rest = tail;
                Ok(value)
            }
            _ => Err(DecodeError::new("field runs past the end of the datagram")),
        }
    }

    /// Takes a zero-terminated string field, consuming the terminator.
    /// Bytes map to chars one-for-one; filenames are not assumed UTF-8.
    fn text(&mut self) -> Result<String, DecodeError> {
        let end = self
            .rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| DecodeError::new("string field is missing its zero terminator"))?;
        let s = self.rest[..end].iter().map(|&b| char::from(b)).collect();
        self.rest = &self.rest[end + 1..];
        Ok(s)
    }

    /// Like [`Scanner::text`] but tolerant of a missing terminator, for
    /// the trailing message of an ERROR packet.
    fn text_to_end(self) -> String {
        self.rest
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| char::from(b))
            .collect()
    }

    /// Everything not yet consumed.
    fn remainder(self) -> &'a [u8] {
        self.rest
    }
}

fn request_fields(mut scan: Scanner) -> Result<(String, TransferMode), DecodeError> {
    let filename = scan.text()?;
    let token = scan.text()?;
    // Whatever follows the mode is option negotiation, which this server
    // does not speak; it decodes fine and is simply not looked at.
    let mode = TransferMode::from_token(&token)
        .ok_or_else(|| DecodeError::new(format!("unrecognised transfer mode {token:?}")))?;
    Ok((filename, mode))
}

impl Packet {
    pub fn decode(datagram: &[u8]) -> Result<Packet, DecodeError> {
        let mut scan = Scanner::new(datagram);
        match scan.word()? {
            OP_RRQ => {
                let (filename, mode) = request_fields(scan)?;
                Ok(Packet::Rrq { filename, mode })
            }
            OP_WRQ => {
                let (filename, mode) = request_fields(scan)?;
                Ok(Packet::Wrq { filename, mode })
            }
            OP_DATA => {
                let block = scan.word()?;
                let payload = scan.remainder();
                if payload.len() > BLOCK_SIZE {
                    return Err(DecodeError::new(format!(
                        "DATA payload of {} bytes exceeds the {BLOCK_SIZE}-byte block",
                        payload.len()
                    )));
                }
                Ok(Packet::Data {
                    block,
                    payload: payload.to_vec(),
                })
            }
            OP_ACK => {
                // Anything after the block number is ignored.
                let block = scan.word()?;
                Ok(Packet::Ack { block })
            }
            OP_ERROR => {
                let code = ErrorCode::from_u16(scan.word()?);
                let message = scan.text_to_end();
                Ok(Packet::Error { code, message })
            }
            op => Err(DecodeError::new(format!("opcode {op} is not a TFTP operation"))),
        }
    }

    /// Lays the packet out in wire order: big-endian opcode first, then
    /// the variant's fields, strings followed by their zero terminator.
    pub fn encode(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(DATAGRAM_CAPACITY);
        match self {
            Packet::Rrq { filename, mode } => {
                wire.extend_from_slice(&OP_RRQ.to_be_bytes());
                push_text(&mut wire, filename);
                push_text(&mut wire, mode.token());
            }
            Packet::Wrq { filename, mode } => {
                wire.extend_from_slice(&OP_WRQ.to_be_bytes());
                push_text(&mut wire, filename);
                push_text(&mut wire, mode.token());
            }
            Packet::Data { block, payload } => {
                wire.extend_from_slice(&OP_DATA.to_be_bytes());
                wire.extend_from_slice(&block.to_be_bytes());
                wire.extend_from_slice(payload);
            }
            Packet::Ack { block } => {
                wire.extend_from_slice(&OP_ACK.to_be_bytes());
                wire.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                wire.extend_from_slice(&OP_ERROR.to_be_bytes());
                wire.extend_from_slice(&code.as_u16().to_be_bytes());
                push_text(&mut wire, message);
            }
        }
        wire
    }
}

fn push_text(wire: &mut Vec<u8>, text: &str) {
    wire.extend_from_slice(text.as_bytes());
    wire.push(0);
}

///////////////////////////////////////////////////////////////
// Socket

/// The datagram transport, speaking [`Packet`] instead of raw bytes.
///
/// Receive goes through a 516-byte buffer owned by this instance and
/// reused for every packet; instances share nothing. Outgoing packets are
/// serialised into their own allocation, which changes nothing a peer can
/// observe.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
    buf: [u8; DATAGRAM_CAPACITY],
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
            buf: [0; DATAGRAM_CAPACITY],
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    /// Waits for the next packet with no deadline. This is the idle
    /// dispatcher's wait, where there is nothing outstanding to re-send.
    pub async fn recv(&mut self) -> TftpResult<(Packet, SocketAddr)> {
        let (len, src) = self.sock.recv_from(&mut self.buf).await?;
        parse_received(&self.buf[..len], src)
    }

    /// Waits for the next packet, giving up after `limit`.
    pub async fn recv_deadline(&mut self, limit: Duration) -> TftpResult<(Packet, SocketAddr)> {
        let (len, src) = timeout(limit, self.sock.recv_from(&mut self.buf)).await??;
        parse_received(&self.buf[..len], src)
    }

    pub async fn send(&mut self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(&packet.encode(), dst).await?;
        Ok(())
    }
}

fn parse_received(datagram: &[u8], src: SocketAddr) -> TftpResult<(Packet, SocketAddr)> {
    match Packet::decode(datagram) {
        Ok(packet) => Ok((packet, src)),
        Err(e) => Err(SocketError::Malformed {
            src,
            reason: e.to_string(),
        }),
    }
}
