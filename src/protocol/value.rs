//! Header value tree.
//!
//! A [`Header`] is an ordered map from string keys to [`Value`]s. Besides the
//! JSON scalar and container kinds, a value can be an [`Attachment`] (sent
//! out-of-band and referenced by position) or a GeoJSON geometry (embedded as
//! `{"format": "geojson", "geometry": ...}`).
//!
//! # Example
//!
//! ```
//! use luci_client::protocol::{Header, Value};
//!
//! let header = Header::new()
//!     .with("run", "scenario.geojson.Get")
//!     .with("ScID", 7)
//!     .with("options", Header::new().with("crs", "EPSG:4326"));
//!
//! assert_eq!(header.get_str("run"), Some("scenario.geojson.Get"));
//! assert_eq!(header.get("ScID").and_then(Value::as_i64), Some(7));
//! assert!(header.get("missing").is_none());
//! ```

use geojson::GeoJson;
use serde_json::{Map, Number, Value as JsonValue};

use super::attachment::Attachment;
use super::store::AttachmentStore;

/// Format marker used for embedded geometries.
pub const GEOJSON_FORMAT: &str = "geojson";

/// A single header value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(Header),
    Attachment(Attachment),
    Geometry(GeoJson),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Header> {
        match self {
            Value::Object(header) => Some(header),
            _ => None,
        }
    }

    pub fn as_attachment(&self) -> Option<&Attachment> {
        match self {
            Value::Attachment(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_geometry(&self) -> Option<&GeoJson> {
        match self {
            Value::Geometry(g) => Some(g),
            _ => None,
        }
    }

    /// Look up a key if this value is an object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|h| h.get(key))
    }

    /// Convert to JSON.
    ///
    /// Attachment positions are taken from `store` when given, otherwise from
    /// the attachment itself.
    pub fn to_json(&self, store: Option<&AttachmentStore>) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Number(n) => JsonValue::Number(n.clone()),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Array(items) => {
                JsonValue::Array(items.iter().map(|v| v.to_json(store)).collect())
            }
            Value::Object(header) => header.to_json(store),
            Value::Attachment(a) => {
                let position = store
                    .and_then(|s| s.position(a.checksum()))
                    .unwrap_or_else(|| a.position());
                a.to_json(position)
            }
            Value::Geometry(g) => {
                let mut map = Map::new();
                map.insert("format".into(), JsonValue::String(GEOJSON_FORMAT.into()));
                map.insert(
                    "geometry".into(),
                    serde_json::to_value(g).unwrap_or(JsonValue::Null),
                );
                JsonValue::Object(map)
            }
        }
    }

    pub(crate) fn visit_attachments_mut(&mut self, f: &mut impl FnMut(&mut Attachment)) {
        match self {
            Value::Attachment(a) => f(a),
            Value::Array(items) => items.iter_mut().for_each(|v| v.visit_attachments_mut(f)),
            Value::Object(header) => header.visit_attachments_mut(f),
            _ => {}
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! impl_from_integer {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(n: $t) -> Self {
                Value::Number(Number::from(n))
            }
        })*
    };
}

impl_from_integer!(i8, i16, i32, i64, u8, u16, u32, u64, usize);

impl From<f64> for Value {
    /// Non-finite numbers have no JSON form and become `Null`.
    fn from(n: f64) -> Self {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::from(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<Header> for Value {
    fn from(header: Header) -> Self {
        Value::Object(header)
    }
}

impl From<Attachment> for Value {
    fn from(a: Attachment) -> Self {
        Value::Attachment(a)
    }
}

impl From<GeoJson> for Value {
    fn from(g: GeoJson) -> Self {
        Value::Geometry(g)
    }
}

impl From<geojson::Geometry> for Value {
    fn from(g: geojson::Geometry) -> Self {
        Value::Geometry(GeoJson::Geometry(g))
    }
}

impl From<geojson::FeatureCollection> for Value {
    fn from(fc: geojson::FeatureCollection) -> Self {
        Value::Geometry(GeoJson::FeatureCollection(fc))
    }
}

impl From<JsonValue> for Value {
    /// Plain structural conversion; attachment and geometry markers are kept
    /// as ordinary objects.
    fn from(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => Value::Number(n),
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            JsonValue::Object(map) => Value::Object(Header::from(map)),
        }
    }
}

/// Ordered string-keyed map of header values. Keys are unique.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    entries: Vec<(String, Value)>,
}

impl Header {
    /// Create an empty header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert a value, replacing (in place) and returning any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Look up a value. Absent keys are `None`, explicit nulls are `Some(Value::Null)`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Look up a string value.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Insert every entry of `other`, overwriting existing keys.
    pub fn merge(&mut self, other: Header) {
        for (key, value) in other.entries {
            self.insert(key, value);
        }
    }

    /// Convert to a JSON object, preserving key order.
    pub fn to_json(&self, store: Option<&AttachmentStore>) -> JsonValue {
        let map: Map<String, JsonValue> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json(store)))
            .collect();
        JsonValue::Object(map)
    }

    pub(crate) fn visit_attachments_mut(&mut self, f: &mut impl FnMut(&mut Attachment)) {
        for (_, value) in self.entries.iter_mut() {
            value.visit_attachments_mut(f);
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Header {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut header = Header::new();
        for (k, v) in iter {
            header.insert(k, v);
        }
        header
    }
}

impl From<Map<String, JsonValue>> for Header {
    fn from(map: Map<String, JsonValue>) -> Self {
        map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()
    }
}

impl PartialEq for Attachment {
    /// Attachments are equal when their contents are (same checksum).
    fn eq(&self, other: &Self) -> bool {
        self.checksum() == other.checksum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_replaces_in_place() {
        let mut header = Header::new().with("a", 1).with("b", 2);
        assert_eq!(header.insert("a", "one"), Some(Value::from(1)));

        let keys: Vec<&str> = header.keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(header.get_str("a"), Some("one"));
        assert_eq!(header.len(), 2);
    }

    #[test]
    fn test_absent_vs_null() {
        let header = Header::new().with("error", Value::Null);
        assert_eq!(header.get("error"), Some(&Value::Null));
        assert!(header.get("result").is_none());
        assert!(header.contains_key("error"));
    }

    #[test]
    fn test_remove_and_merge() {
        let mut header = Header::new().with("run", "ServiceList").with("x", true);
        assert_eq!(header.remove("x"), Some(Value::Bool(true)));
        assert!(header.remove("x").is_none());

        header.merge(Header::new().with("run", "scenario.GetList").with("y", 2.5));
        assert_eq!(header.get_str("run"), Some("scenario.GetList"));
        assert_eq!(header.get("y").and_then(Value::as_f64), Some(2.5));
    }

    #[test]
    fn test_to_json_preserves_order_and_nesting() {
        let header = Header::new()
            .with("zeta", vec![1, 2])
            .with("alpha", Header::new().with("inner", Value::Null));
        let json = header.to_json(None);

        assert_eq!(json, json!({"zeta": [1, 2], "alpha": {"inner": null}}));
        let text = serde_json::to_string(&json).unwrap();
        assert!(text.find("zeta").unwrap() < text.find("alpha").unwrap());
    }

    #[test]
    fn test_geometry_to_json() {
        let point = geojson::Geometry::new(geojson::Value::Point(vec![8.5, 47.4]));
        let json = Value::from(point).to_json(None);

        assert_eq!(json["format"], "geojson");
        assert_eq!(json["geometry"]["type"], "Point");
        assert_eq!(json["geometry"]["coordinates"], json!([8.5, 47.4]));
    }

    #[test]
    fn test_from_json_is_structural() {
        let value = Value::from(json!({"a": [true, null, "s"], "b": {"c": 1}}));
        let a = value.get("a").and_then(Value::as_array).unwrap();
        assert_eq!(a, &[Value::Bool(true), Value::Null, Value::from("s")]);
        assert_eq!(value.get("b").and_then(|b| b.get("c")).and_then(Value::as_u64), Some(1));
    }

    #[test]
    fn test_non_finite_float_becomes_null() {
        assert!(Value::from(f64::NAN).is_null());
        assert_eq!(Value::from(None::<i32>), Value::Null);
    }

    #[test]
    fn test_visit_attachments_reaches_nested() {
        let mut value = Value::from(
            Header::new()
                .with("list", vec![Value::from(Attachment::from_bytes("a", &b"1"[..]))])
                .with("one", Attachment::from_bytes("b", &b"2"[..])),
        );
        let mut seen = 0;
        value.visit_attachments_mut(&mut |_| seen += 1);
        assert_eq!(seen, 2);
    }
}
