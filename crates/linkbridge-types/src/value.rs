//! [`WireValue`] – the untyped value tree carried inside every envelope.
//!
//! The tree mirrors what both wire formats can express, plus one variant
//! only the binary container can hold: [`WireValue::Bytes`].  JSON has no
//! byte-string type, so envelopes that contain bytes must travel as
//! MessagePack.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{self, SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// String-keyed map sorted by key, used for envelope bodies and nested
/// messages.  Both containers emit the keys in that sorted order.
pub type WireMap = BTreeMap<String, WireValue>;

/// A dynamically typed value decoded from (or encoded to) the wire.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum WireValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    /// Only used for unsigned values above `i64::MAX`.
    UInt(u64),
    Float(f64),
    String(String),
    /// Raw binary payload (e.g. `uint8[]` image data).
    Bytes(Vec<u8>),
    Array(Vec<WireValue>),
    Map(WireMap),
}

impl WireValue {
    /// Build a [`WireValue::Bytes`] from anything byte-like.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        WireValue::Bytes(data.into())
    }

    /// An empty map.
    pub fn map() -> Self {
        WireValue::Map(WireMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, WireValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            WireValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            WireValue::Int(i) => Some(*i),
            WireValue::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            WireValue::Int(i) => u64::try_from(*i).ok(),
            WireValue::UInt(u) => Some(*u),
            _ => None,
        }
    }

    /// Numeric view; integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            WireValue::Int(i) => Some(*i as f64),
            WireValue::UInt(u) => Some(*u as f64),
            WireValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&WireMap> {
        match self {
            WireValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[WireValue]> {
        match self {
            WireValue::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Look up `key` when `self` is a map.
    pub fn get(&self, key: &str) -> Option<&WireValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// `true` when this value or anything nested inside it is
    /// [`WireValue::Bytes`].
    pub fn contains_bytes(&self) -> bool {
        match self {
            WireValue::Bytes(_) => true,
            WireValue::Array(items) => items.iter().any(WireValue::contains_bytes),
            WireValue::Map(map) => map.values().any(WireValue::contains_bytes),
            _ => false,
        }
    }

    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            WireValue::Null => "null",
            WireValue::Bool(_) => "bool",
            WireValue::Int(_) | WireValue::UInt(_) => "integer",
            WireValue::Float(_) => "float",
            WireValue::String(_) => "string",
            WireValue::Bytes(_) => "bytes",
            WireValue::Array(_) => "array",
            WireValue::Map(_) => "map",
        }
    }
}

impl fmt::Display for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireValue::Null => write!(f, "null"),
            WireValue::Bool(b) => write!(f, "{b}"),
            WireValue::Int(i) => write!(f, "{i}"),
            WireValue::UInt(u) => write!(f, "{u}"),
            WireValue::Float(x) => write!(f, "{x}"),
            WireValue::String(s) => write!(f, "{s}"),
            WireValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            WireValue::Array(a) => write!(f, "<array of {}>", a.len()),
            WireValue::Map(m) => write!(f, "<map of {}>", m.len()),
        }
    }
}

impl From<&str> for WireValue {
    fn from(s: &str) -> Self {
        WireValue::String(s.to_string())
    }
}

impl From<String> for WireValue {
    fn from(s: String) -> Self {
        WireValue::String(s)
    }
}

impl From<bool> for WireValue {
    fn from(b: bool) -> Self {
        WireValue::Bool(b)
    }
}

impl From<i64> for WireValue {
    fn from(i: i64) -> Self {
        WireValue::Int(i)
    }
}

impl From<i32> for WireValue {
    fn from(i: i32) -> Self {
        WireValue::Int(i64::from(i))
    }
}

impl From<u64> for WireValue {
    fn from(u: u64) -> Self {
        match i64::try_from(u) {
            Ok(i) => WireValue::Int(i),
            Err(_) => WireValue::UInt(u),
        }
    }
}

impl From<usize> for WireValue {
    fn from(u: usize) -> Self {
        WireValue::from(u as u64)
    }
}

impl From<f64> for WireValue {
    fn from(f: f64) -> Self {
        WireValue::Float(f)
    }
}

impl From<WireMap> for WireValue {
    fn from(m: WireMap) -> Self {
        WireValue::Map(m)
    }
}

impl From<Vec<WireValue>> for WireValue {
    fn from(a: Vec<WireValue>) -> Self {
        WireValue::Array(a)
    }
}

// ---------------------------------------------------------------------------
// serde
// ---------------------------------------------------------------------------

impl Serialize for WireValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            WireValue::Null => serializer.serialize_unit(),
            WireValue::Bool(b) => serializer.serialize_bool(*b),
            WireValue::Int(i) => serializer.serialize_i64(*i),
            WireValue::UInt(u) => serializer.serialize_u64(*u),
            WireValue::Float(x) => {
                // JSON would silently turn these into `null`.
                if !x.is_finite() && serializer.is_human_readable() {
                    return Err(ser::Error::custom(format!(
                        "non-finite float {x} has no text representation"
                    )));
                }
                serializer.serialize_f64(*x)
            }
            WireValue::String(s) => serializer.serialize_str(s),
            WireValue::Bytes(b) => serializer.serialize_bytes(b),
            WireValue::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            WireValue::Map(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    out.serialize_entry(k, v)?;
                }
                out.end()
            }
        }
    }
}

struct WireValueVisitor;

impl<'de> Visitor<'de> for WireValueVisitor {
    type Value = WireValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any wire value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<WireValue, E> {
        Ok(WireValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<WireValue, E> {
        Ok(WireValue::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<WireValue, D::Error> {
        WireValue::deserialize(deserializer)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<WireValue, E> {
        Ok(WireValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<WireValue, E> {
        Ok(WireValue::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<WireValue, E> {
        Ok(WireValue::from(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<WireValue, E> {
        Ok(WireValue::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<WireValue, E> {
        Ok(WireValue::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<WireValue, E> {
        Ok(WireValue::String(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<WireValue, E> {
        Ok(WireValue::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<WireValue, E> {
        Ok(WireValue::Bytes(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<WireValue, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(4096));
        while let Some(item) = seq.next_element::<WireValue>()? {
            items.push(item);
        }
        Ok(WireValue::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<WireValue, A::Error> {
        let mut map = WireMap::new();
        while let Some((k, v)) = access.next_entry::<String, WireValue>()? {
            map.insert(k, v);
        }
        Ok(WireValue::Map(map))
    }
}

impl<'de> Deserialize<'de> for WireValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(WireValueVisitor)
    }
}
