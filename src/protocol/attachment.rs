//! Binary attachments addressed by content checksum.
//!
//! An attachment is identified by the uppercase hex MD5 digest of its bytes.
//! Small payloads live in memory as [`Bytes`]; payloads at or above the
//! configured memory limit are spilled to a temporary file that is removed
//! when the last clone of the attachment is dropped.
//!
//! # Example
//!
//! ```
//! use luci_client::protocol::Attachment;
//!
//! let attachment = Attachment::from_bytes("txt", &b"hello"[..]).with_name("greeting.txt");
//! assert_eq!(attachment.checksum(), "5D41402ABC4B2A76B9719D911017C592");
//! assert_eq!(attachment.len(), 5);
//! assert_eq!(attachment.position(), 0);
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use md5::{Digest, Md5};
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::wire_format::CodecConfig;
use crate::error::{LuciError, Result};
use crate::transport::MixedStream;

/// Chunk size used when streaming attachments through disk.
const DISK_CHUNK_SIZE: usize = 1024 * 1024;

/// Compute the checksum of a byte slice (uppercase hex MD5).
pub fn checksum(data: &[u8]) -> String {
    format!("{:X}", Md5::digest(data))
}

/// A binary payload carried next to the message header.
#[derive(Debug, Clone)]
pub struct Attachment {
    format: String,
    name: Option<String>,
    crs: Option<String>,
    checksum: String,
    length: u64,
    /// 1-based position in the frame trailer, 0 while unassigned.
    position: u32,
    backing: Backing,
}

#[derive(Debug, Clone)]
enum Backing {
    Memory(Bytes),
    Disk(Arc<DiskFile>),
}

/// File backing a disk attachment; temporary files are removed on drop.
#[derive(Debug)]
struct DiskFile {
    path: PathBuf,
    temporary: bool,
}

impl Drop for DiskFile {
    fn drop(&mut self) {
        if self.temporary {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Attachment {
    /// Create an in-memory attachment.
    pub fn from_bytes(format: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            format: format.into(),
            name: None,
            crs: None,
            checksum: checksum(&data),
            length: data.len() as u64,
            position: 0,
            backing: Backing::Memory(data),
        }
    }

    /// Create a disk-backed attachment from an existing file.
    ///
    /// The format is the file extension; the checksum is computed by
    /// streaming the file. The file is not removed when the attachment drops.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = path
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut file = tokio::fs::File::open(path).await?;
        let (digest, length) = digest_reader(&mut file).await?;

        Ok(Self {
            format,
            name: None,
            crs: None,
            checksum: digest,
            length,
            position: 0,
            backing: Backing::Disk(Arc::new(DiskFile {
                path: path.to_path_buf(),
                temporary: false,
            })),
        })
    }

    /// Set the attachment name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the coordinate reference system tag.
    pub fn with_crs(mut self, crs: impl Into<String>) -> Self {
        self.crs = Some(crs.into());
        self
    }

    /// Format (content type or file extension).
    pub fn format(&self) -> &str {
        &self.format
    }

    /// Optional name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Optional coordinate reference system.
    pub fn crs(&self) -> Option<&str> {
        self.crs.as_deref()
    }

    /// Uppercase hex checksum of the payload.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Payload length in bytes.
    pub fn len(&self) -> u64 {
        self.length
    }

    /// True for a zero-length payload.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// 1-based position in the frame, 0 if unassigned.
    pub fn position(&self) -> u32 {
        self.position
    }

    /// True if the payload is stored in a file.
    pub fn is_on_disk(&self) -> bool {
        matches!(self.backing, Backing::Disk(_))
    }

    /// In-memory payload, `None` for disk-backed attachments.
    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.backing {
            Backing::Memory(data) => Some(data),
            Backing::Disk(_) => None,
        }
    }

    /// Backing file, `None` for in-memory attachments.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Memory(_) => None,
            Backing::Disk(file) => Some(&file.path),
        }
    }

    /// Load the whole payload into memory.
    pub async fn read_all(&self) -> Result<Bytes> {
        match &self.backing {
            Backing::Memory(data) => Ok(data.clone()),
            Backing::Disk(file) => Ok(Bytes::from(tokio::fs::read(&file.path).await?)),
        }
    }

    /// Accept `claimed` as this attachment's checksum only if it matches the
    /// digest of the backing bytes.
    ///
    /// File-backed payloads are hashed again from disk. Hex case is not
    /// significant. On mismatch nothing is changed.
    pub async fn set_checksum(&mut self, claimed: &str) -> Result<()> {
        let actual = match &self.backing {
            Backing::Memory(data) => checksum(data),
            Backing::Disk(file) => {
                let mut reader = tokio::fs::File::open(&file.path).await?;
                digest_reader(&mut reader).await?.0
            }
        };
        self.accept_checksum(claimed, actual)
    }

    /// Check `claimed` against the digest computed while the payload was received.
    pub(crate) fn verify_received(&mut self, claimed: &str) -> Result<()> {
        let actual = self.checksum.clone();
        self.accept_checksum(claimed, actual)
    }

    fn accept_checksum(&mut self, claimed: &str, actual: String) -> Result<()> {
        if !actual.eq_ignore_ascii_case(claimed) {
            return Err(LuciError::ChecksumMismatch {
                claimed: claimed.to_string(),
                actual,
            });
        }
        self.checksum = actual;
        Ok(())
    }

    pub(crate) fn set_position(&mut self, position: u32) {
        self.position = position;
    }

    pub(crate) fn set_descriptors(
        &mut self,
        format: Option<String>,
        name: Option<String>,
        crs: Option<String>,
    ) {
        if let Some(format) = format {
            self.format = format;
        }
        self.name = name;
        self.crs = crs;
    }

    /// Header representation, referencing the payload by `position`.
    pub fn to_json(&self, position: u32) -> JsonValue {
        json!({
            "format": self.format,
            "name": self.name,
            "crs": self.crs,
            "attachment": {
                "checksum": self.checksum,
                "length": self.length,
                "position": position,
            }
        })
    }

    /// Read a payload of `length` bytes from the frame trailer.
    pub(crate) async fn read_from<S: AsyncRead + Unpin>(
        stream: &mut MixedStream<S>,
        length: u64,
        position: u32,
        config: &CodecConfig,
    ) -> Result<Self> {
        let mut attachment = if length < config.memory_limit {
            let len = usize::try_from(length).map_err(|_| {
                LuciError::Protocol(format!("attachment length {} too large", length))
            })?;
            let data = stream.read_vec(len).await?;
            if data.len() < len {
                return Err(LuciError::Truncated {
                    expected: length,
                    actual: data.len() as u64,
                });
            }
            Self::from_bytes("", data)
        } else {
            tracing::debug!(
                "Attachment {} ({} bytes) exceeds memory limit, spilling to disk",
                position,
                length
            );
            Self::spill_to_disk(stream, length, &config.temp_dir).await?
        };
        attachment.position = position;
        Ok(attachment)
    }

    async fn spill_to_disk<S: AsyncRead + Unpin>(
        stream: &mut MixedStream<S>,
        length: u64,
        dir: &Path,
    ) -> Result<Self> {
        let file = Arc::new(DiskFile {
            path: temp_attachment_path(dir),
            temporary: true,
        });
        let mut out = tokio::fs::File::create(&file.path).await?;
        let mut hasher = Md5::new();
        let mut chunk = vec![0u8; DISK_CHUNK_SIZE];
        let mut remaining = length;

        while remaining > 0 {
            let want = remaining.min(DISK_CHUNK_SIZE as u64) as usize;
            let n = stream.read_exact(&mut chunk[..want]).await?;
            hasher.update(&chunk[..n]);
            out.write_all(&chunk[..n]).await?;
            if n < want {
                return Err(LuciError::Truncated {
                    expected: length,
                    actual: length - remaining + n as u64,
                });
            }
            remaining -= n as u64;
        }
        out.flush().await?;

        let digest = format!("{:X}", hasher.finalize());
        Ok(Self {
            format: String::new(),
            name: None,
            crs: None,
            checksum: digest,
            length,
            position: 0,
            backing: Backing::Disk(file),
        })
    }

    /// Write the raw payload to the stream.
    pub(crate) async fn write_to<S: AsyncWrite + Unpin>(
        &self,
        stream: &mut MixedStream<S>,
    ) -> Result<()> {
        match &self.backing {
            Backing::Memory(data) => stream.write_exact(data).await?,
            Backing::Disk(file) => {
                let mut reader = tokio::fs::File::open(&file.path).await?;
                let copied = stream.write_from(&mut reader).await?;
                if copied != self.length {
                    return Err(LuciError::Protocol(format!(
                        "attachment file {} changed size: expected {} bytes, wrote {}",
                        file.path.display(),
                        self.length,
                        copied
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Stream a reader to completion, returning its checksum and length.
async fn digest_reader<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(String, u64)> {
    let mut hasher = Md5::new();
    let mut chunk = vec![0u8; DISK_CHUNK_SIZE];
    let mut length = 0u64;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
        length += n as u64;
    }
    Ok((format!("{:X}", hasher.finalize()), length))
}

/// Generate a unique file path for a spilled attachment.
///
/// Format: `{dir}/luci-attachment-{pid}-{random}.bin`
fn temp_attachment_path(dir: &Path) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id() as u64;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand = nanos.wrapping_mul(0x517cc1b727220a95) ^ pid ^ seq.rotate_left(32);

    dir.join(format!("luci-attachment-{}-{:x}-{}.bin", pid, rand, seq))
}
