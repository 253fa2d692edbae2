//! Core types for the snapshot engine.
//!
//! A change payload and a stored snapshot both use the same recursive
//! [`Value`]: a scalar, an ordered array, or an ordered map of named fields.

use crate::error::{Result, SnapshotError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Metadata attached to a stored snapshot (e.g. `revision`).
pub type Meta = serde_json::Map<String, serde_json::Value>;

/// Position of a message in a stream.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl Sequence {
    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }
}

/// Type tag of a scalar.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarKind {
    Null,
    Boolean,
    Int64,
    Uint64,
    Float64,
    String,
    Binary,
    /// Microseconds since Unix epoch.
    Time,
}

impl ScalarKind {
    /// Stable one-byte tag, used as the first byte of store keys.
    pub fn tag(self) -> u8 {
        match self {
            ScalarKind::Null => 0,
            ScalarKind::Boolean => 1,
            ScalarKind::Int64 => 2,
            ScalarKind::Uint64 => 3,
            ScalarKind::Float64 => 4,
            ScalarKind::String => 5,
            ScalarKind::Binary => 6,
            ScalarKind::Time => 7,
        }
    }
}

/// A scalar value in canonical byte form.
///
/// Numerics are little-endian, strings are UTF-8, time is an `i64` of
/// microseconds since the epoch.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scalar {
    pub kind: ScalarKind,
    pub bytes: Vec<u8>,
}

impl Scalar {
    pub fn null() -> Self {
        Self {
            kind: ScalarKind::Null,
            bytes: Vec::new(),
        }
    }

    pub fn boolean(v: bool) -> Self {
        Self {
            kind: ScalarKind::Boolean,
            bytes: vec![v as u8],
        }
    }

    pub fn int64(v: i64) -> Self {
        Self {
            kind: ScalarKind::Int64,
            bytes: v.to_le_bytes().to_vec(),
        }
    }

    pub fn uint64(v: u64) -> Self {
        Self {
            kind: ScalarKind::Uint64,
            bytes: v.to_le_bytes().to_vec(),
        }
    }

    pub fn float64(v: f64) -> Self {
        Self {
            kind: ScalarKind::Float64,
            bytes: v.to_le_bytes().to_vec(),
        }
    }

    pub fn string(v: impl Into<String>) -> Self {
        Self {
            kind: ScalarKind::String,
            bytes: v.into().into_bytes(),
        }
    }

    pub fn binary(v: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: ScalarKind::Binary,
            bytes: v.into(),
        }
    }

    pub fn time_micros(v: i64) -> Self {
        Self {
            kind: ScalarKind::Time,
            bytes: v.to_le_bytes().to_vec(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.kind == ScalarKind::Null
    }

    /// Store key: the kind tag followed by the canonical bytes, so equal
    /// bytes of different kinds never share a key.
    pub fn key_bytes(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.bytes.len() + 1);
        key.push(self.kind.tag());
        key.extend_from_slice(&self.bytes);
        key
    }

    fn le_8(&self) -> Option<[u8; 8]> {
        self.bytes.as_slice().try_into().ok()
    }

    /// Convert to JSON. Malformed numeric bytes become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self.kind {
            ScalarKind::Null => Json::Null,
            ScalarKind::Boolean => Json::Bool(self.bytes.first().is_some_and(|b| *b != 0)),
            ScalarKind::Int64 => self
                .le_8()
                .map(|b| Json::from(i64::from_le_bytes(b)))
                .unwrap_or(Json::Null),
            ScalarKind::Uint64 => self
                .le_8()
                .map(|b| Json::from(u64::from_le_bytes(b)))
                .unwrap_or(Json::Null),
            ScalarKind::Float64 => self
                .le_8()
                .and_then(|b| serde_json::Number::from_f64(f64::from_le_bytes(b)))
                .map(Json::Number)
                .unwrap_or(Json::Null),
            ScalarKind::String => Json::String(String::from_utf8_lossy(&self.bytes).into_owned()),
            ScalarKind::Binary => Json::String(BASE64.encode(&self.bytes)),
            ScalarKind::Time => self
                .le_8()
                .and_then(|b| chrono::DateTime::from_timestamp_micros(i64::from_le_bytes(b)))
                .map(|t| Json::String(t.to_rfc3339()))
                .unwrap_or(Json::Null),
        }
    }
}

impl fmt::Debug for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind, self.to_json())
    }
}

/// A named entry of a map value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: Value,
}

impl Field {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Recursive structured value.
///
/// Map field names are unique within one map; field order is insertion order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Scalar(Scalar),
    Array(Vec<Value>),
    Map(Vec<Field>),
}

impl Value {
    /// An empty map.
    pub fn empty_map() -> Self {
        Value::Map(Vec::new())
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Value::Map(_))
    }

    /// Look up a field of a map value. Non-map values have no fields.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Map(fields) => fields.iter().find(|f| f.name == name).map(|f| &f.value),
            Value::Scalar(_) | Value::Array(_) => None,
        }
    }

    /// Set a field on a map value, replacing an existing field of the same name.
    ///
    /// Does nothing on a non-map value.
    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        if let Value::Map(fields) = self {
            let name = name.into();
            match fields.iter_mut().find(|f| f.name == name) {
                Some(existing) => existing.value = value,
                None => fields.push(Field { name, value }),
            }
        }
    }

    /// Store key of a non-null scalar.
    pub fn key_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Value::Scalar(s) if !s.is_null() => Some(s.key_bytes()),
            Value::Scalar(_) | Value::Array(_) | Value::Map(_) => None,
        }
    }

    /// Build a value from JSON. Objects become maps, integers prefer `Int64`.
    pub fn from_json(json: &serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match json {
            Json::Null => Value::Scalar(Scalar::null()),
            Json::Bool(b) => Value::Scalar(Scalar::boolean(*b)),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Scalar(Scalar::int64(i))
                } else if let Some(u) = n.as_u64() {
                    Value::Scalar(Scalar::uint64(u))
                } else {
                    Value::Scalar(Scalar::float64(n.as_f64().unwrap_or_default()))
                }
            }
            Json::String(s) => Value::Scalar(Scalar::string(s.as_str())),
            Json::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            Json::Object(obj) => Value::Map(
                obj.iter()
                    .map(|(k, v)| Field::new(k.as_str(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Scalar(s) => s.to_json(),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|f| (f.name.clone(), f.value.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<Scalar> for Value {
    fn from(s: Scalar) -> Self {
        Value::Scalar(s)
    }
}

/// Kind of change an event describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Insert,
    Update,
    Delete,
}

/// A change against one record, as carried in a stream message body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Source event name (informational).
    #[serde(default)]
    pub event_name: String,
    pub table: String,
    pub method: Method,
    /// Name of the payload field holding the primary key.
    pub primary_key: String,
    pub payload: Value,
}

impl ChangeEvent {
    pub fn new(
        table: impl Into<String>,
        method: Method,
        primary_key: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_name: String::new(),
            table: table.into(),
            method,
            primary_key: primary_key.into(),
            payload,
        }
    }

    /// Create an event whose payload is built from JSON.
    pub fn json(
        table: impl Into<String>,
        method: Method,
        primary_key: impl Into<String>,
        payload: &serde_json::Value,
    ) -> Self {
        Self::new(table, method, primary_key, Value::from_json(payload))
    }

    pub fn with_event_name(mut self, name: impl Into<String>) -> Self {
        self.event_name = name.into();
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }

    /// Raw value of the primary key field, if present.
    pub fn primary_key_value(&self) -> Option<&Value> {
        if self.primary_key.is_empty() {
            return None;
        }
        self.payload.field(&self.primary_key)
    }

    /// Primary key bytes.
    ///
    /// `Ok(None)` when the event has no key; an error when the key field is
    /// not a usable scalar.
    pub fn primary_key_bytes(&self) -> Result<Option<Vec<u8>>> {
        let value = match self.primary_key_value() {
            Some(v) => v,
            None => return Ok(None),
        };

        match value.key_bytes() {
            Some(bytes) => Ok(Some(bytes)),
            None => Err(SnapshotError::InvalidOperation(format!(
                "primary key field '{}' is not a scalar",
                self.primary_key
            ))),
        }
    }
}

/// The durable form of a materialized record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Merged payload (a map). `None` only for records written without one.
    #[serde(default)]
    pub payload: Option<Value>,

    /// Overwrite-by-key metadata; never deep-merged.
    #[serde(default)]
    pub meta: Meta,
}

impl SnapshotRecord {
    pub fn new(payload: Value) -> Self {
        Self {
            payload: Some(payload),
            meta: Meta::new(),
        }
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }

    /// Payload as JSON (`null` when absent).
    pub fn payload_json(&self) -> serde_json::Value {
        self.payload
            .as_ref()
            .map(Value::to_json)
            .unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_conversion() {
        let doc = json!({
            "id": 7,
            "name": "Alice",
            "score": 1.5,
            "tags": ["a", "b"],
            "address": {"city": "X"},
            "deleted": false,
            "note": null
        });

        let value = Value::from_json(&doc);
        assert!(value.is_map());
        assert_eq!(value.to_json(), doc);
    }

    #[test]
    fn test_field_lookup_and_set() {
        let mut value = Value::from_json(&json!({"a": 1}));
        assert!(value.field("a").is_some());
        assert!(value.field("b").is_none());

        value.set_field("a", Scalar::string("x").into());
        value.set_field("b", Scalar::boolean(true).into());
        assert_eq!(value.to_json(), json!({"a": "x", "b": true}));

        // Scalars have no fields
        let mut scalar = Value::Scalar(Scalar::int64(1));
        scalar.set_field("a", Scalar::null().into());
        assert!(scalar.field("a").is_none());
    }

    #[test]
    fn test_primary_key_bytes() {
        let event = ChangeEvent::json("users", Method::Insert, "id", &json!({"id": 42}));
        let key = event.primary_key_bytes().unwrap().unwrap();
        assert_eq!(key, Scalar::int64(42).key_bytes());
        assert_eq!(key[0], ScalarKind::Int64.tag());
        assert_eq!(&key[1..], 42i64.to_le_bytes());

        let missing = ChangeEvent::json("users", Method::Insert, "id", &json!({"name": "x"}));
        assert!(missing.primary_key_bytes().unwrap().is_none());

        let null_key = ChangeEvent::json("users", Method::Insert, "id", &json!({"id": null}));
        assert!(null_key.primary_key_bytes().is_err());

        let map_key = ChangeEvent::json("users", Method::Insert, "id", &json!({"id": {"a": 1}}));
        assert!(map_key.primary_key_bytes().is_err());

        let unnamed = ChangeEvent::json("users", Method::Insert, "", &json!({"id": 1}));
        assert!(unnamed.primary_key_bytes().unwrap().is_none());
    }

    #[test]
    fn test_key_bytes_distinguish_kinds() {
        let signed = Value::Scalar(Scalar::int64(-1)).key_bytes().unwrap();
        let unsigned = Value::Scalar(Scalar::uint64(u64::MAX)).key_bytes().unwrap();
        assert_eq!(Scalar::int64(-1).bytes, Scalar::uint64(u64::MAX).bytes);
        assert_ne!(signed, unsigned);

        assert_ne!(Scalar::string("1").key_bytes(), Scalar::binary(b"1".to_vec()).key_bytes());
        assert_ne!(Scalar::int64(7).key_bytes(), Scalar::time_micros(7).key_bytes());
        assert!(Value::Scalar(Scalar::null()).key_bytes().is_none());
    }

    #[test]
    fn test_event_encoding() {
        let event = ChangeEvent::json("users", Method::Update, "id", &json!({"id": 1, "n": "a"}))
            .with_event_name("userUpdated");
        let decoded = ChangeEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);

        assert!(ChangeEvent::decode(b"\xc1garbage").is_err());
    }

    #[test]
    fn test_snapshot_record_meta_survives_encoding() {
        let mut meta = Meta::new();
        meta.insert("revision".into(), json!(3));
        meta.insert("source".into(), json!("x"));

        let record = SnapshotRecord::new(Value::from_json(&json!({"a": 1}))).with_meta(meta);
        let decoded = SnapshotRecord::decode(&record.encode().unwrap()).unwrap();

        assert_eq!(decoded.meta["revision"], json!(3));
        assert_eq!(decoded.meta["source"], json!("x"));
        assert_eq!(decoded.payload_json(), json!({"a": 1}));
    }

    #[test]
    fn test_scalar_time_and_binary_to_json() {
        let t = Scalar::time_micros(0);
        assert_eq!(t.to_json(), json!("1970-01-01T00:00:00+00:00"));

        let b = Scalar::binary(vec![1u8, 2, 3]);
        assert_eq!(b.to_json(), json!("AQID"));

        let broken = Scalar {
            kind: ScalarKind::Int64,
            bytes: vec![1, 2],
        };
        assert_eq!(broken.to_json(), serde_json::Value::Null);
    }
}
