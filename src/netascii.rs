//! Host-to-NETASCII translation for outgoing transfers.
//!
//! NETASCII line endings are the two-byte sequence CR LF, and a bare CR is
//! escaped as CR NUL. Expanding one source byte into two can land exactly on
//! a 512-byte block boundary, in which case the second byte is deferred and
//! becomes the first byte of the next block. [`NetasciiEncoder`] carries
//! that state between blocks; at most one carry flag is set at a time.
//!
//! Incoming NETASCII is stored verbatim, so only the expanding direction
//! lives here.

use std::io;

use crate::store::FileReader;
use crate::tftp::BLOCK_SIZE;

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const NUL: u8 = 0x00;

#[derive(Debug, Default)]
pub struct NetasciiEncoder {
    /// A CR LF expansion split at the block boundary; the LF opens the next
    /// block.
    pending_lf: bool,
    /// A CR NUL escape split at the block boundary; the NUL opens the next
    /// block.
    pending_nul: bool,
    /// The upcoming source byte is the LF of a CR LF pair already emitted;
    /// it passes through without a second CR.
    suppress_cr_next: bool,
}

impl NetasciiEncoder {
    pub fn new() -> NetasciiEncoder {
        NetasciiEncoder::default()
    }

    /// Translates source bytes into the next DATA payload of at most 512
    /// bytes. A payload shorter than 512 bytes means the file is drained
    /// and no carry remains.
    pub async fn next_block<R: FileReader>(&mut self, reader: &mut R) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(BLOCK_SIZE);

        // A deferred byte from the previous block goes out first.
        if self.pending_lf {
            buf.push(LF);
            self.pending_lf = false;
        } else if self.pending_nul {
            buf.push(NUL);
            self.pending_nul = false;
        }

        while buf.len() < BLOCK_SIZE {
            let c = match reader.read_byte().await? {
                Some(c) => c,
                None => break,
            };

            if self.suppress_cr_next {
                // The LF half of a pair whose CR is already out.
                self.suppress_cr_next = false;
                buf.push(c);
            } else if c == CR && reader.peek().await? == Some(LF) {
                buf.push(CR);
                self.suppress_cr_next = true;
            } else if c == CR {
                buf.push(CR);
                if buf.len() == BLOCK_SIZE {
                    self.pending_nul = true;
                    break;
                }
                buf.push(NUL);
            } else if c == LF {
                buf.push(CR);
                if buf.len() == BLOCK_SIZE {
                    self.pending_lf = true;
                    break;
                }
                buf.push(LF);
            } else {
                buf.push(c);
            }
        }

        Ok(buf)
    }
}
