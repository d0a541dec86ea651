//! The file store backing transfers.
//!
//! Transactions talk to storage through the narrow [`FileStore`] interface:
//! existence checks, an exclusive reader, an exclusive creating writer. The
//! reader exposes one byte of lookahead because the NETASCII translator
//! needs to see the byte after a carriage return before deciding what to
//! emit. [`DirStore`] is the production implementation, serving files from
//! a root directory via `tokio::fs`.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::tftp::BLOCK_SIZE;

/// An open file being streamed out to a client.
pub trait FileReader {
    /// Reads into `buf` until it is full or the file ends. A count shorter
    /// than `buf` means end-of-file.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Consumes and returns the next byte, or `None` at end-of-file.
    async fn read_byte(&mut self) -> io::Result<Option<u8>>;

    /// Returns the next byte without consuming it, or `None` at end-of-file.
    async fn peek(&mut self) -> io::Result<Option<u8>>;
}

/// A file being received from a client.
pub trait FileWriter {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Pushes buffered bytes down to the backing store.
    async fn sync(&mut self) -> io::Result<()>;
}

/// The file system as the transfer engine sees it.
///
/// A transaction holds at most one open handle, for its own duration only;
/// every exit path releases it.
pub trait FileStore {
    type Reader: FileReader;
    type Writer: FileWriter;

    async fn exists(&self, path: &str) -> bool;

    async fn open_read(&self, path: &str) -> io::Result<Self::Reader>;

    /// Creates `path` exclusively; fails if it already exists.
    async fn open_create_write(&self, path: &str) -> io::Result<Self::Writer>;
}

///////////////////////////////////////////////////////////////
// Directory-backed store

/// Serves files from a directory subtree.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> DirStore {
        DirStore { root: root.into() }
    }

    /// Requested paths are rooted at the store directory; a leading slash is
    /// stripped so absolute-looking names stay inside the subtree.
    fn resolve(&self, path: &str) -> PathBuf {
        let open_path = path.strip_prefix('/').unwrap_or(path);
        self.root.join(Path::new(open_path))
    }
}

impl FileStore for DirStore {
    type Reader = DirReader;
    type Writer = DirWriter;

    async fn exists(&self, path: &str) -> bool {
        tokio::fs::try_exists(self.resolve(path)).await.unwrap_or(false)
    }

    async fn open_read(&self, path: &str) -> io::Result<DirReader> {
        let file = File::open(self.resolve(path)).await?;
        Ok(DirReader {
            file,
            buf: [0; BLOCK_SIZE],
            len: 0,
            pos: 0,
        })
    }

    async fn open_create_write(&self, path: &str) -> io::Result<DirWriter> {
        let file = File::create_new(self.resolve(path)).await?;
        Ok(DirWriter { file })
    }
}

/// Buffered reader over a file on disk. The internal buffer is what makes
/// single-byte lookahead affordable.
pub struct DirReader {
    file: File,
    buf: [u8; BLOCK_SIZE],
    len: usize,
    pos: usize,
}

impl DirReader {
    /// Refills the internal buffer if it has been drained. Returns the
    /// number of buffered bytes remaining; zero means end-of-file.
    async fn fill(&mut self) -> io::Result<usize> {
        if self.pos == self.len {
            self.len = self.file.read(&mut self.buf).await?;
            self.pos = 0;
        }
        Ok(self.len - self.pos)
    }
}

impl FileReader for DirReader {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // A single read may return less than asked for, so keep pulling
        // until the output is full or the file runs out.
        let mut filled = 0;
        while filled < buf.len() {
            let available = self.fill().await?;
            if available == 0 {
                break;
            }
            let take = available.min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&self.buf[self.pos..self.pos + take]);
            self.pos += take;
            filled += take;
        }
        Ok(filled)
    }

    async fn read_byte(&mut self) -> io::Result<Option<u8>> {
        if self.fill().await? == 0 {
            return Ok(None);
        }
        let c = self.buf[self.pos];
        self.pos += 1;
        Ok(Some(c))
    }

    async fn peek(&mut self) -> io::Result<Option<u8>> {
        if self.fill().await? == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf[self.pos]))
    }
}

pub struct DirWriter {
    file: File,
}

impl FileWriter for DirWriter {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf).await
    }

    async fn sync(&mut self) -> io::Result<()> {
        self.file.flush().await
    }
}

///////////////////////////////////////////////////////////////
// In-memory store for tests
