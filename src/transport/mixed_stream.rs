//! Buffered stream supporting both line reads and exact-length binary I/O.
//!
//! A single reusable buffer sits between the socket and its readers:
//! - `read_line` scans the buffer for `\n`, refilling as needed
//! - `read_exact` drains buffered bytes first, then reads straight through
//! - writes are passed to the underlying stream and flushed immediately
//!
//! # Example
//!
//! ```ignore
//! use luci_client::transport::MixedStream;
//!
//! let mut stream = MixedStream::new(tcp_stream);
//! let greeting = stream.read_line().await?;
//! let mut len = [0u8; 8];
//! let n = stream.read_exact(&mut len).await?;
//! ```

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default buffer size (2 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Growth step of [`MixedStream::read_vec`].
const READ_VEC_CHUNK: usize = 1024 * 1024;

/// Byte stream wrapper with a single internal read buffer.
pub struct MixedStream<S> {
    inner: S,
    buffer: Box<[u8]>,
    /// Read position inside `buffer`.
    pos: usize,
    /// Number of valid bytes in `buffer`.
    filled: usize,
}

impl<S> MixedStream<S> {
    /// Wrap a stream with the default 2 MiB buffer.
    pub fn new(inner: S) -> Self {
        Self::with_capacity(inner, DEFAULT_BUFFER_SIZE)
    }

    /// Wrap a stream with a custom buffer size (minimum 1 byte).
    pub fn with_capacity(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            buffer: vec![0u8; capacity.max(1)].into_boxed_slice(),
            pos: 0,
            filled: 0,
        }
    }

    /// Capacity of the internal buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Number of bytes read from the socket but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.filled - self.pos
    }

    /// Discard all unread buffered data.
    pub fn reset_buffer(&mut self) {
        self.pos = 0;
        self.filled = 0;
    }

    /// Get a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Get a mutable reference to the underlying stream.
    ///
    /// Reading from it directly bypasses (and may desynchronize) the buffer.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwrap the stream, dropping any buffered bytes.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> MixedStream<S> {
    /// Read one line terminated by `\n`.
    ///
    /// The terminator is consumed and trailing `\r` characters are stripped.
    /// If the stream ends before a terminator, everything read so far is
    /// returned as-is (an empty string at immediate end of stream).
    pub async fn read_line(&mut self) -> io::Result<String> {
        let mut line = Vec::new();

        loop {
            if self.pos < self.filled {
                let unread = &self.buffer[self.pos..self.filled];
                if let Some(idx) = unread.iter().position(|&b| b == b'\n') {
                    line.extend_from_slice(&unread[..idx]);
                    self.pos += idx + 1;
                    while line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return into_string(line);
                }
                line.extend_from_slice(unread);
            }

            // Everything unread is now in `line`, so the buffer can start over.
            self.reset_buffer();
            let n = self.inner.read(&mut self.buffer[..]).await?;
            if n == 0 {
                return into_string(line);
            }
            self.filled = n;
        }
    }

    /// Read up to `out.len()` bytes, returning how many were obtained.
    ///
    /// Fewer bytes are returned only when the underlying stream ends; callers
    /// that need the full length must treat a short count as truncation.
    pub async fn read_exact(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let wanted = out.len();
        if wanted == 0 {
            return Ok(0);
        }

        let mut have = 0;
        if self.pos < self.filled {
            have = (self.filled - self.pos).min(wanted);
            out[..have].copy_from_slice(&self.buffer[self.pos..self.pos + have]);
            self.pos += have;
            if have == wanted {
                return Ok(wanted);
            }
        }

        // pos == filled here, the buffer holds nothing unread
        self.reset_buffer();
        loop {
            let n = self.inner.read(&mut self.buffer[self.filled..]).await?;
            if n == 0 {
                break;
            }
            self.filled += n;

            if have + self.filled >= wanted {
                let take = wanted - have;
                out[have..].copy_from_slice(&self.buffer[..take]);
                self.pos = take;
                return Ok(wanted);
            }

            if self.filled == self.buffer.len() {
                out[have..have + self.filled].copy_from_slice(&self.buffer[..self.filled]);
                have += self.filled;
                self.reset_buffer();
            }
        }

        if self.filled > 0 {
            out[have..have + self.filled].copy_from_slice(&self.buffer[..self.filled]);
            have += self.filled;
            self.reset_buffer();
        }
        Ok(have)
    }

    /// Read exactly `len` bytes into a fresh vector, returning the short
    /// vector if the stream ends early.
    ///
    /// The vector grows as data arrives, so a declared length never
    /// allocates more than one chunk beyond the bytes actually received.
    pub async fn read_vec(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len.min(READ_VEC_CHUNK));
        while out.len() < len {
            let start = out.len();
            let want = (len - start).min(READ_VEC_CHUNK);
            out.resize(start + want, 0);
            let n = self.read_exact(&mut out[start..]).await?;
            out.truncate(start + n);
            if n < want {
                break;
            }
        }
        Ok(out)
    }
}

impl<S: AsyncWrite + Unpin> MixedStream<S> {
    /// Write all bytes and flush.
    pub async fn write_exact(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await
    }

    /// Write UTF-8 text and flush.
    pub async fn write_str(&mut self, text: &str) -> io::Result<()> {
        self.write_exact(text.as_bytes()).await
    }

    /// Write UTF-8 text followed by `\n` and flush.
    pub async fn write_line(&mut self, text: &str) -> io::Result<()> {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(b'\n');
        self.write_exact(&bytes).await
    }

    /// Copy an entire reader into the stream and flush, returning the byte count.
    pub async fn write_from<R: AsyncRead + Unpin + ?Sized>(
        &mut self,
        reader: &mut R,
    ) -> io::Result<u64> {
        let copied = tokio::io::copy(reader, &mut self.inner).await?;
        self.inner.flush().await?;
        Ok(copied)
    }

    /// Flush the underlying stream.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }
}

fn into_string(bytes: Vec<u8>) -> io::Result<String> {
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
