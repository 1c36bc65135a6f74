//! Message: header tree plus deduplicated attachments, and its frame codec.
//!
//! Encoding walks the header, moves every attachment into the message's
//! [`AttachmentStore`] (deduplicating by checksum) and serializes the header
//! as JSON with attachments replaced by position references.
//!
//! Decoding reads the raw attachments from the trailer, then resolves every
//! `{"attachment": {...}}` reference in the header against them, verifying
//! the claimed checksum.
//!
//! # Example
//!
//! ```
//! use luci_client::protocol::{Attachment, Header, Message, State};
//!
//! let mut message = Message::new(
//!     Header::new()
//!         .with("run", "scenario.geojson.Create")
//!         .with("data", Attachment::from_bytes("csv", &b"x,y"[..])),
//! );
//! assert_eq!(message.state(), State::Run);
//! assert_eq!(message.attachment_count(), 1);
//! ```

use std::fmt;

use geojson::GeoJson;
use serde_json::{Map, Value as JsonValue};
use tokio::io::{AsyncRead, AsyncWrite};

use super::attachment::Attachment;
use super::store::AttachmentStore;
use super::value::{Header, Value, GEOJSON_FORMAT};
use super::wire_format::{
    attachments_block_length, encode_length, expect_length_field, read_length_field,
    validate_length, CodecConfig,
};
use crate::error::{LuciError, Result};
use crate::transport::MixedStream;

/// Processing state carried by a message's top-level keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Result,
    Error,
    Progress,
    Cancel,
    Run,
    None,
}

impl State {
    /// State keys in resolution priority order.
    pub const PRIORITY: [(&'static str, State); 5] = [
        ("result", State::Result),
        ("error", State::Error),
        ("progress", State::Progress),
        ("cancel", State::Cancel),
        ("run", State::Run),
    ];

    /// True for states that end a request: result, error, cancel, run.
    pub fn is_terminal(self) -> bool {
        !matches!(self, State::Progress | State::None)
    }
}

/// One protocol exchange unit.
#[derive(Debug, Clone)]
pub struct Message {
    header: Header,
    attachments: AttachmentStore,
}

impl Message {
    /// Build an outgoing message.
    ///
    /// Attachments found anywhere in the header are collected into the store;
    /// equal contents are stored once and every reference points at that entry.
    pub fn new(mut header: Header) -> Self {
        let mut attachments = AttachmentStore::new();
        header.visit_attachments_mut(&mut |a| {
            // Positions from a received message do not carry over.
            let mut fresh = a.clone();
            fresh.set_position(0);
            *a = attachments.insert(fresh).clone();
        });
        Self {
            header,
            attachments,
        }
    }

    /// Rebuild a received message from its header text and raw trailer attachments.
    pub fn from_parts(header_text: &str, raw: Vec<Attachment>) -> Result<Self> {
        let json: JsonValue = serde_json::from_str(header_text)?;
        let JsonValue::Object(map) = json else {
            return Err(LuciError::Protocol(
                "message header is not a JSON object".to_string(),
            ));
        };

        let mut decoder = Decoder {
            raw,
            store: AttachmentStore::new(),
        };
        let header = decoder.object(map)?;
        Ok(Self {
            header,
            attachments: decoder.store,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn into_header(self) -> Header {
        self.header
    }

    /// State from the first present, non-null key among
    /// `result`, `error`, `progress`, `cancel`, `run`.
    pub fn state(&self) -> State {
        State::PRIORITY
            .iter()
            .find(|(key, _)| self.header.get(key).is_some_and(|v| !v.is_null()))
            .map(|(_, state)| *state)
            .unwrap_or(State::None)
    }

    /// The `result` payload, if any.
    pub fn result(&self) -> Option<&Value> {
        self.header.get("result")
    }

    /// The `error` description, rendered as text.
    pub fn error(&self) -> Option<String> {
        match self.header.get("error")? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_json(None).to_string()),
        }
    }

    /// Turn an `error` state into `LuciError::Server` and `none` into
    /// `LuciError::InvalidState`.
    pub fn into_result(self) -> Result<Self> {
        match self.state() {
            State::Error => Err(LuciError::Server(self.error().unwrap_or_default())),
            State::None => Err(LuciError::InvalidState),
            _ => Ok(self),
        }
    }

    /// Attachments in wire order, assigning positions on first use.
    pub fn attachments(&mut self) -> Vec<&Attachment> {
        self.attachments.assign_positions();
        self.attachments.ordered()
    }

    pub fn attachment_store(&self) -> &AttachmentStore {
        &self.attachments
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    /// Sum of attachment payload lengths.
    pub fn attachments_length(&self) -> u64 {
        self.attachments.total_length()
    }

    /// Header as JSON, with attachment references resolved against the store.
    pub fn header_json(&self) -> JsonValue {
        self.header.to_json(Some(&self.attachments))
    }

    /// Write this message as one frame, flushing after every field.
    pub async fn write_to<S: AsyncWrite + Unpin>(&mut self, stream: &mut MixedStream<S>) -> Result<()> {
        // Positions must exist before the header text references them.
        self.attachments.assign_positions();
        let header_bytes = serde_json::to_vec(&self.header_json())?;
        let count = self.attachments.len() as u64;
        let block_len = attachments_block_length(self.attachments.total_length(), count);

        stream
            .write_exact(&encode_length(header_bytes.len() as i64))
            .await?;
        stream.write_exact(&encode_length(block_len as i64)).await?;
        stream.write_exact(&header_bytes).await?;
        stream.write_exact(&encode_length(count as i64)).await?;

        for attachment in self.attachments.ordered() {
            stream
                .write_exact(&encode_length(attachment.len() as i64))
                .await?;
            attachment.write_to(stream).await?;
        }
        Ok(())
    }

    /// Read one frame.
    ///
    /// A stream that closes before the first byte yields
    /// `LuciError::ConnectionClosed`; a frame cut short anywhere else is
    /// `LuciError::Truncated`.
    pub async fn read_from<S: AsyncRead + Unpin>(
        stream: &mut MixedStream<S>,
        config: &CodecConfig,
    ) -> Result<Self> {
        let header_len = read_length_field(stream)
            .await?
            .ok_or(LuciError::ConnectionClosed)?;
        let header_len = validate_length("headerLength", header_len, config.max_header_size)?;
        let block_len = expect_length_field(stream).await?;

        let header_bytes = stream.read_vec(header_len as usize).await?;
        if (header_bytes.len() as u64) < header_len {
            return Err(LuciError::Truncated {
                expected: header_len,
                actual: header_bytes.len() as u64,
            });
        }
        let header_text = String::from_utf8(header_bytes)
            .map_err(|e| LuciError::Protocol(format!("header is not valid UTF-8: {}", e)))?;

        let count = expect_length_field(stream).await?;
        let count = validate_length("numAttachments", count, config.max_attachments)?;

        let mut raw = Vec::with_capacity(count.min(1024) as usize);
        let mut total = 0u64;
        for i in 0..count {
            let len = expect_length_field(stream).await?;
            let len = validate_length("attachmentLength", len, i64::MAX as u64)?;
            raw.push(Attachment::read_from(stream, len, i as u32 + 1, config).await?);
            total += len;
        }

        let consumed = attachments_block_length(total, count);
        if block_len < 0 || block_len as u64 != consumed {
            tracing::warn!(
                "attachmentsBlockLength is {} but {} bytes were consumed",
                block_len,
                consumed
            );
        }

        Self::from_parts(&header_text, raw)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.header_json())
    }
}

/// Resolves attachment and geometry markers while converting received JSON.
struct Decoder {
    raw: Vec<Attachment>,
    store: AttachmentStore,
}

impl Decoder {
    fn object(&mut self, map: Map<String, JsonValue>) -> Result<Header> {
        let mut header = Header::new();
        for (key, value) in map {
            let value = self.value(value)?;
            header.insert(key, value);
        }
        Ok(header)
    }

    fn value(&mut self, json: JsonValue) -> Result<Value> {
        match json {
            JsonValue::Object(map) => {
                if let Some(info) = map.get("attachment").filter(|a| !a.is_null()) {
                    if let Some(attachment) = self.attachment(info, &map)? {
                        return Ok(Value::Attachment(attachment));
                    }
                    return Ok(Value::Object(self.object(map)?));
                }
                let is_geojson = map
                    .get("format")
                    .and_then(JsonValue::as_str)
                    .is_some_and(|f| f.eq_ignore_ascii_case(GEOJSON_FORMAT));
                if is_geojson {
                    return geometry(map).map(Value::Geometry);
                }
                Ok(Value::Object(self.object(map)?))
            }
            JsonValue::Array(items) => items
                .into_iter()
                .map(|item| self.value(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            scalar => Ok(Value::from(scalar)),
        }
    }

    /// Resolve a reference with a positive position; `None` for position 0.
    fn attachment(
        &mut self,
        info: &JsonValue,
        map: &Map<String, JsonValue>,
    ) -> Result<Option<Attachment>> {
        let position = match info.get("position") {
            None | Some(JsonValue::Null) => 0,
            Some(value) => value.as_u64().ok_or_else(|| {
                LuciError::Protocol(format!("attachment position {} is not an integer", value))
            })?,
        };
        if position == 0 {
            return Ok(None);
        }

        let available = self.raw.len();
        let raw = usize::try_from(position - 1)
            .ok()
            .and_then(|idx| self.raw.get_mut(idx))
            .ok_or_else(|| {
                LuciError::Protocol(format!(
                    "attachment position {} out of range (frame has {})",
                    position, available
                ))
            })?;

        let claimed = info
            .get("checksum")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| {
                LuciError::Protocol(format!("attachment {} has no checksum", position))
            })?;
        raw.verify_received(claimed)?;

        let text = |key: &str| map.get(key).and_then(JsonValue::as_str).map(str::to_string);
        raw.set_descriptors(text("format"), text("name"), text("crs"));

        let resolved = raw.clone();
        self.store.insert(resolved.clone());
        Ok(Some(resolved))
    }
}

fn geometry(mut map: Map<String, JsonValue>) -> Result<GeoJson> {
    let geometry = map
        .remove("geometry")
        .ok_or_else(|| LuciError::Protocol("geojson value has no geometry".to_string()))?;
    Ok(serde_json::from_value(geometry)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::attachment::checksum;
    use crate::protocol::wire_format::{DEFAULT_MAX_HEADER_SIZE, DEFAULT_MEMORY_LIMIT, LENGTH_FIELD_SIZE};
    use serde_json::json;

    async fn encode(message: &mut Message) -> Vec<u8> {
        let mut stream = MixedStream::new(Vec::new());
        message.write_to(&mut stream).await.unwrap();
        stream.into_inner()
    }

    async fn decode(bytes: &[u8]) -> Result<Message> {
        let mut stream = MixedStream::with_capacity(bytes, 32);
        Message::read_from(&mut stream, &CodecConfig::default()).await
    }

    fn frame(header: &JsonValue, attachments: &[&[u8]]) -> Vec<u8> {
        let header = serde_json::to_vec(header).unwrap();
        let total: usize = attachments.iter().map(|a| a.len()).sum();
        let mut bytes = Vec::new();
        bytes.extend(encode_length(header.len() as i64));
        bytes.extend(encode_length(
            attachments_block_length(total as u64, attachments.len() as u64) as i64,
        ));
        bytes.extend(header);
        bytes.extend(encode_length(attachments.len() as i64));
        for a in attachments {
            bytes.extend(encode_length(a.len() as i64));
            bytes.extend_from_slice(a);
        }
        bytes
    }

    #[test]
    fn test_state_priority() {
        let both = Message::new(Header::new().with("error", "bad").with("result", 1));
        assert_eq!(both.state(), State::Result);

        let none = Message::new(Header::new().with("other", 1));
        assert_eq!(none.state(), State::None);

        let progress = Message::new(Header::new().with("progress", 50).with("run", "x"));
        assert_eq!(progress.state(), State::Progress);

        let null_result = Message::new(Header::new().with("result", Value::Null).with("cancel", true));
        assert_eq!(null_result.state(), State::Cancel);
    }

    #[test]
    fn test_terminal_states() {
        assert!(State::Result.is_terminal());
        assert!(State::Error.is_terminal());
        assert!(State::Cancel.is_terminal());
        assert!(State::Run.is_terminal());
        assert!(!State::Progress.is_terminal());
        assert!(!State::None.is_terminal());
    }

    #[test]
    fn test_new_deduplicates_attachments() {
        let message = Message::new(
            Header::new()
                .with("a", Attachment::from_bytes("txt", &b"same"[..]).with_name("a"))
                .with("b", vec![Value::from(Attachment::from_bytes("txt", &b"same"[..]))]),
        );
        assert_eq!(message.attachment_count(), 1);
        assert_eq!(message.attachments_length(), 4);
    }

    #[tokio::test]
    async fn test_encode_frame_layout() {
        let mut message = Message::new(
            Header::new()
                .with("run", "test")
                .with("file", Attachment::from_bytes("bin", &b"abc"[..])),
        );
        let bytes = encode(&mut message).await;

        let header_len = i64::from_be_bytes(bytes[0..8].try_into().unwrap()) as usize;
        let block_len = i64::from_be_bytes(bytes[8..16].try_into().unwrap());
        assert_eq!(block_len, 3 + 2 * LENGTH_FIELD_SIZE as i64);

        let header: JsonValue = serde_json::from_slice(&bytes[16..16 + header_len]).unwrap();
        assert_eq!(header["run"], "test");
        assert_eq!(header["file"]["attachment"]["position"], 1);
        assert_eq!(header["file"]["attachment"]["checksum"], checksum(b"abc"));

        let rest = &bytes[16 + header_len..];
        assert_eq!(&rest[0..8], &encode_length(1));
        assert_eq!(&rest[8..16], &encode_length(3));
        assert_eq!(&rest[16..], b"abc");
    }

    #[tokio::test]
    async fn test_encode_without_attachments() {
        let mut message = Message::new(Header::new().with("run", "ServiceList"));
        let bytes = encode(&mut message).await;

        let header_len = i64::from_be_bytes(bytes[0..8].try_into().unwrap()) as usize;
        assert_eq!(&bytes[8..16], &encode_length(8));
        assert_eq!(&bytes[16 + header_len..], &encode_length(0));
    }

    #[tokio::test]
    async fn test_round_trip() {
        let point = geojson::Geometry::new(geojson::Value::Point(vec![1.5, 2.5]));
        let mut message = Message::new(
            Header::new()
                .with("run", "scenario.geojson.Create")
                .with("count", 3)
                .with("flag", false)
                .with("nested", Header::new().with("list", vec![1, 2, 3]).with("none", Value::Null))
                .with("file", Attachment::from_bytes("txt", &b"hello"[..]).with_name("h.txt"))
                .with("shape", point.clone()),
        );
        let bytes = encode(&mut message).await;
        let decoded = decode(&bytes).await.unwrap();
        let header = decoded.header();

        assert_eq!(header.get_str("run"), Some("scenario.geojson.Create"));
        assert_eq!(header.get("count").and_then(Value::as_i64), Some(3));
        assert_eq!(header.get("flag").and_then(Value::as_bool), Some(false));
        let nested = header.get("nested").and_then(Value::as_object).unwrap();
        assert_eq!(nested.get("list"), Some(&Value::from(vec![1, 2, 3])));
        assert_eq!(nested.get("none"), Some(&Value::Null));

        let file = header.get("file").and_then(Value::as_attachment).unwrap();
        assert_eq!(file.format(), "txt");
        assert_eq!(file.name(), Some("h.txt"));
        assert_eq!(file.position(), 1);
        assert_eq!(file.checksum(), checksum(b"hello"));
        assert_eq!(&file.bytes().unwrap()[..], b"hello");

        assert_eq!(
            header.get("shape").and_then(Value::as_geometry),
            Some(&GeoJson::Geometry(point))
        );
    }

    #[tokio::test]
    async fn test_dedup_survives_round_trip() {
        let mut message = Message::new(
            Header::new()
                .with("first", Attachment::from_bytes("bin", &b"payload"[..]))
                .with("second", vec![Value::from(Attachment::from_bytes("bin", &b"payload"[..]))]),
        );
        let bytes = encode(&mut message).await;
        let decoded = decode(&bytes).await.unwrap();

        assert_eq!(decoded.attachment_count(), 1);
        let first = decoded.header().get("first").and_then(Value::as_attachment).unwrap();
        let second = decoded
            .header()
            .get("second")
            .and_then(Value::as_array)
            .and_then(|items| items[0].as_attachment())
            .unwrap();
        assert_eq!(first.position(), 1);
        assert_eq!(second.position(), 1);
        assert_eq!(first.checksum(), second.checksum());
    }

    #[tokio::test]
    async fn test_forwarding_partially_referenced_trailer() {
        let header = json!({
            "result": {
                "format": "bin",
                "attachment": {"checksum": checksum(b"second"), "length": 6, "position": 2}
            }
        });
        let mut received = decode(&frame(&header, &[b"first", b"second"])).await.unwrap();
        assert_eq!(received.attachment_count(), 1);

        let forwarded = decode(&encode(&mut received).await).await.unwrap();
        let attachment = forwarded.result().and_then(Value::as_attachment).unwrap();
        assert_eq!(attachment.position(), 1);
        assert_eq!(&attachment.bytes().unwrap()[..], b"second");
        assert_eq!(forwarded.attachment_count(), 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_decode() {
        let header = json!({
            "result": {
                "format": "bin",
                "attachment": {"checksum": checksum(b"expected"), "length": 8, "position": 1}
            }
        });
        let bytes = frame(&header, &[b"tampered"]);

        let err = decode(&bytes).await.unwrap_err();
        assert!(err.is_integrity());
    }

    #[tokio::test]
    async fn test_attachment_position_out_of_range() {
        let header = json!({
            "result": {"format": "bin", "attachment": {"checksum": "00", "length": 1, "position": 2}}
        });
        let bytes = frame(&header, &[b"x"]);

        let err = decode(&bytes).await.unwrap_err();
        assert!(matches!(err, LuciError::Protocol(msg) if msg.contains("out of range")));
    }

    #[tokio::test]
    async fn test_unpositioned_reference_stays_plain_object() {
        let header = json!({"result": {"format": "bin", "attachment": {"checksum": "00", "position": 0}}});
        let decoded = decode(&frame(&header, &[])).await.unwrap();

        let result = decoded.result().and_then(Value::as_object).unwrap();
        assert_eq!(result.get_str("format"), Some("bin"));
        assert_eq!(decoded.attachment_count(), 0);
    }

    #[tokio::test]
    async fn test_non_integer_position_rejected() {
        for position in [json!(1.0), json!("1"), json!(-1)] {
            let header = json!({
                "result": {
                    "format": "bin",
                    "attachment": {"checksum": checksum(b"x"), "length": 1, "position": position}
                }
            });
            let err = decode(&frame(&header, &[b"x"])).await.unwrap_err();
            assert!(matches!(err, LuciError::Protocol(msg) if msg.contains("not an integer")));
        }
    }

    #[tokio::test]
    async fn test_geojson_format_case_insensitive() {
        let header = json!({"result": {"format": "GeoJSON", "geometry": {"type": "Point", "coordinates": [0.0, 1.0]}}});
        let decoded = decode(&frame(&header, &[])).await.unwrap();

        assert!(decoded.result().and_then(Value::as_geometry).is_some());
    }

    #[tokio::test]
    async fn test_connection_closed_at_frame_boundary() {
        let err = decode(&[]).await.unwrap_err();
        assert!(matches!(err, LuciError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let mut bytes = frame(&json!({"result": "ok"}), &[]);
        bytes.truncate(20);

        let err = decode(&bytes).await.unwrap_err();
        assert!(matches!(err, LuciError::Truncated { .. }));
    }

    #[tokio::test]
    async fn test_declared_lengths_beyond_received_bytes() {
        let huge = (DEFAULT_MAX_HEADER_SIZE - 1) as i64;
        let mut bytes = Vec::new();
        bytes.extend(encode_length(huge));
        bytes.extend(encode_length(8));
        bytes.extend(b"{}");

        let err = decode(&bytes).await.unwrap_err();
        assert!(matches!(err, LuciError::Truncated { actual: 2, .. }));

        let mut bytes = frame(&json!({"result": "ok"}), &[]);
        let count_at = bytes.len() - LENGTH_FIELD_SIZE;
        bytes.truncate(count_at);
        bytes.extend(encode_length(1));
        bytes.extend(encode_length((DEFAULT_MEMORY_LIMIT - 1) as i64));
        bytes.extend(b"abc");

        let err = decode(&bytes).await.unwrap_err();
        assert!(matches!(err, LuciError::Truncated { actual: 3, .. }));
    }

    #[tokio::test]
    async fn test_truncated_attachment() {
        let mut bytes = frame(&json!({"result": "ok"}), &[b"0123456789"]);
        bytes.truncate(bytes.len() - 4);

        let err = decode(&bytes).await.unwrap_err();
        assert!(matches!(err, LuciError::Truncated { expected: 10, actual: 6 }));
    }

    #[tokio::test]
    async fn test_negative_header_length_rejected() {
        let mut bytes = Vec::new();
        bytes.extend(encode_length(-5));
        bytes.extend(encode_length(8));

        let err = decode(&bytes).await.unwrap_err();
        assert!(matches!(err, LuciError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_malformed_header_text() {
        let mut bytes = Vec::new();
        bytes.extend(encode_length(3));
        bytes.extend(encode_length(8));
        bytes.extend(b"{no");
        bytes.extend(encode_length(0));

        let err = decode(&bytes).await.unwrap_err();
        assert!(matches!(err, LuciError::Json(_)));
    }

    #[tokio::test]
    async fn test_block_length_is_advisory() {
        let mut bytes = frame(&json!({"result": "ok"}), &[]);
        bytes[8..16].copy_from_slice(&encode_length(999));

        let decoded = decode(&bytes).await.unwrap();
        assert_eq!(decoded.state(), State::Result);
    }

    #[test]
    fn test_into_result() {
        let err = Message::new(Header::new().with("error", "no such scenario"))
            .into_result()
            .unwrap_err();
        assert!(matches!(err, LuciError::Server(msg) if msg == "no such scenario"));

        let err = Message::new(Header::new()).into_result().unwrap_err();
        assert!(matches!(err, LuciError::InvalidState));

        assert!(Message::new(Header::new().with("result", 1)).into_result().is_ok());
    }

    #[test]
    fn test_display_is_header_json() {
        let message = Message::new(Header::new().with("run", "ServiceList"));
        assert_eq!(message.to_string(), r#"{"run":"ServiceList"}"#);
    }
}
