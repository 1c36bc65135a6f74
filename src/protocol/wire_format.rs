//! Wire format encoding and decoding.
//!
//! A frame is laid out as:
//! ```text
//! ┌──────────────┬──────────────┬────────────┬──────────┬─────────────────────────┐
//! │ Header len   │ Attach. len  │ Header     │ Count    │ (Length, Bytes) × Count │
//! │ 8 bytes      │ 8 bytes      │ UTF-8 JSON │ 8 bytes  │ 8 bytes + N bytes each  │
//! │ int64 BE     │ int64 BE     │            │ int64 BE │                         │
//! └──────────────┴──────────────┴────────────┴──────────┴─────────────────────────┘
//! ```
//!
//! All integers are 8-byte Big Endian regardless of host byte order.
//! The attachments length covers the count field and every length-prefixed
//! attachment: `sum(lengths) + (count + 1) * 8`.

use std::path::PathBuf;

use tokio::io::AsyncRead;

use crate::error::{LuciError, Result};
use crate::transport::MixedStream;

/// Size of every length/count field in bytes.
pub const LENGTH_FIELD_SIZE: usize = 8;

/// Default maximum header size (256 MiB).
pub const DEFAULT_MAX_HEADER_SIZE: u64 = 256 * 1024 * 1024;

/// Default threshold at which attachments are spilled to disk (500 MiB).
pub const DEFAULT_MEMORY_LIMIT: u64 = 500 * 1024 * 1024;

/// Default maximum number of attachments in one frame.
pub const DEFAULT_MAX_ATTACHMENTS: u64 = 1 << 20;

/// Limits and storage settings used when decoding frames.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Attachments of this length or more are written to disk instead of memory.
    pub memory_limit: u64,
    /// Directory for disk-backed attachments.
    pub temp_dir: PathBuf,
    /// Largest accepted header length.
    pub max_header_size: u64,
    /// Largest accepted attachment count.
    pub max_attachments: u64,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            memory_limit: DEFAULT_MEMORY_LIMIT,
            temp_dir: std::env::temp_dir(),
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_attachments: DEFAULT_MAX_ATTACHMENTS,
        }
    }
}

/// Encode a length field (Big Endian).
///
/// # Example
///
/// ```
/// use luci_client::protocol::encode_length;
///
/// assert_eq!(encode_length(258), [0, 0, 0, 0, 0, 0, 1, 2]);
/// ```
#[inline]
pub fn encode_length(value: i64) -> [u8; LENGTH_FIELD_SIZE] {
    value.to_be_bytes()
}

/// Decode a length field (Big Endian).
///
/// Returns `None` if buffer is too short.
#[inline]
pub fn decode_length(buf: &[u8]) -> Option<i64> {
    let bytes: [u8; LENGTH_FIELD_SIZE] = buf.get(..LENGTH_FIELD_SIZE)?.try_into().ok()?;
    Some(i64::from_be_bytes(bytes))
}

/// Value of the redundant attachments-block length field.
#[inline]
pub fn attachments_block_length(total_attachment_bytes: u64, count: u64) -> u64 {
    total_attachment_bytes + (count + 1) * LENGTH_FIELD_SIZE as u64
}

/// Check that a decoded length is non-negative and within `max`.
pub fn validate_length(field: &str, value: i64, max: u64) -> Result<u64> {
    if value < 0 {
        return Err(LuciError::Protocol(format!(
            "{} is negative ({})",
            field, value
        )));
    }
    let value = value as u64;
    if value > max {
        return Err(LuciError::Protocol(format!(
            "{} {} exceeds maximum {}",
            field, value, max
        )));
    }
    Ok(value)
}

/// Read one length field from the stream.
///
/// A stream that ends before the first byte yields `Ok(None)`; one that ends
/// partway through the field is a truncation error.
pub async fn read_length_field<S: AsyncRead + Unpin>(
    stream: &mut MixedStream<S>,
) -> Result<Option<i64>> {
    let mut buf = [0u8; LENGTH_FIELD_SIZE];
    let n = stream.read_exact(&mut buf).await?;
    match n {
        0 => Ok(None),
        LENGTH_FIELD_SIZE => Ok(decode_length(&buf)),
        _ => Err(LuciError::Truncated {
            expected: LENGTH_FIELD_SIZE as u64,
            actual: n as u64,
        }),
    }
}

/// Read one length field, treating end of stream as truncation.
pub async fn expect_length_field<S: AsyncRead + Unpin>(stream: &mut MixedStream<S>) -> Result<i64> {
    read_length_field(stream).await?.ok_or(LuciError::Truncated {
        expected: LENGTH_FIELD_SIZE as u64,
        actual: 0,
    })
}
