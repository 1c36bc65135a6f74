//! Protocol module - wire format, header tree, attachments and messages.
//!
//! This module implements the frame format exchanged with the service:
//! - 8-byte Big Endian length fields
//! - JSON header tree with attachment and geometry placeholders
//! - content-addressed attachments with checksum verification

mod attachment;
mod message;
mod store;
mod value;
mod wire_format;

pub use attachment::{checksum, Attachment};
pub use message::{Message, State};
pub use store::AttachmentStore;
pub use value::{Header, Value, GEOJSON_FORMAT};
pub use wire_format::{
    attachments_block_length, decode_length, encode_length, validate_length, CodecConfig,
    DEFAULT_MAX_ATTACHMENTS, DEFAULT_MAX_HEADER_SIZE, DEFAULT_MEMORY_LIMIT, LENGTH_FIELD_SIZE,
};
