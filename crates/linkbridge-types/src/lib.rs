mod value;

pub use value::{WireMap, WireValue};

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Severity carried by outbound `status` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
        }
    }
}

/// One decoded protocol message.
///
/// Always carries an `op` string; `id` is an opaque correlation value echoed
/// back in responses.  Every other field is opcode-specific.  Fields are
/// kept sorted by key, which is also the order they are written in.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    fields: WireMap,
}

impl Envelope {
    pub fn new(op: impl Into<String>) -> Self {
        let mut fields = WireMap::new();
        fields.insert("op".into(), WireValue::String(op.into()));
        Self { fields }
    }

    /// Validate a decoded map as an envelope.
    pub fn from_map(fields: WireMap) -> Result<Self, BridgeError> {
        match fields.get("op") {
            Some(WireValue::String(_)) => Ok(Self { fields }),
            Some(other) => Err(BridgeError::InvalidField {
                field: "op".into(),
                reason: format!("expected string, got {}", other.kind()),
            }),
            None => Err(BridgeError::MissingField("op".into())),
        }
    }

    /// `status` envelope reporting `msg` at `level`, correlated with `id`.
    pub fn status(level: Level, msg: impl Into<String>, id: Option<WireValue>) -> Self {
        let msg: String = msg.into();
        let mut env = Self::new("status")
            .with("level", level.as_str())
            .with("msg", msg);
        if let Some(id) = id {
            env.insert("id", id);
        }
        env
    }

    pub fn op(&self) -> &str {
        self.fields.get("op").and_then(WireValue::as_str).unwrap_or_default()
    }

    pub fn id(&self) -> Option<&WireValue> {
        self.fields.get("id").filter(|v| !v.is_null())
    }

    /// The correlation id rendered for log lines.
    pub fn id_display(&self) -> String {
        self.id().map(ToString::to_string).unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&WireValue> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<WireValue>) -> Option<WireValue> {
        self.fields.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<WireValue> {
        self.fields.remove(key)
    }

    /// Builder-style [`Envelope::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<WireValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Required string field.
    pub fn str_field(&self, key: &str) -> Result<&str, BridgeError> {
        self.opt_str(key)?
            .ok_or_else(|| BridgeError::MissingField(key.into()))
    }

    /// Optional string field; present with another type is an error.
    pub fn opt_str(&self, key: &str) -> Result<Option<&str>, BridgeError> {
        match self.fields.get(key) {
            None | Some(WireValue::Null) => Ok(None),
            Some(WireValue::String(s)) => Ok(Some(s)),
            Some(other) => Err(invalid(key, "string", other)),
        }
    }

    pub fn opt_u64(&self, key: &str) -> Result<Option<u64>, BridgeError> {
        match self.fields.get(key) {
            None | Some(WireValue::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| invalid(key, "non-negative integer", v)),
        }
    }

    pub fn opt_bool(&self, key: &str) -> Result<Option<bool>, BridgeError> {
        match self.fields.get(key) {
            None | Some(WireValue::Null) => Ok(None),
            Some(WireValue::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(invalid(key, "bool", other)),
        }
    }

    /// `true` when any field holds raw bytes, which forces the binary
    /// container on the wire.
    pub fn contains_bytes(&self) -> bool {
        self.fields.values().any(WireValue::contains_bytes)
    }

    pub fn fields(&self) -> &WireMap {
        &self.fields
    }

    pub fn into_map(self) -> WireMap {
        self.fields
    }
}

fn invalid(field: &str, expected: &str, got: &WireValue) -> BridgeError {
    BridgeError::InvalidField {
        field: field.into(),
        reason: format!("expected {expected}, got {}", got.kind()),
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = WireMap::deserialize(deserializer)?;
        Envelope::from_map(fields).map_err(de::Error::custom)
    }
}

/// Error type shared by every linkbridge crate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("unknown op: {0}")]
    UnknownOp(String),

    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("topic {topic} already established with type {existing}, not {requested}")]
    TypeConflict {
        topic: String,
        existing: String,
        requested: String,
    },

    #[error("topic {0} has no established type; specify one")]
    TopicNotEstablished(String),

    #[error("{0} is not allowed by the configured globs")]
    NotAllowed(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("service call failed: {0}")]
    ServiceFailed(String),

    #[error("delivery to {target} failed: {reason}")]
    Delivery { target: String, reason: String },

    #[error("channel error: {0}")]
    Channel(String),

    #[error("rdf error: {0}")]
    Rdf(String),
}

impl BridgeError {
    /// Errors caused by the client's input, reported back as `status`
    /// envelopes rather than logged as server faults.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            BridgeError::UnknownOp(_)
                | BridgeError::MissingField(_)
                | BridgeError::InvalidField { .. }
                | BridgeError::TypeConflict { .. }
                | BridgeError::TopicNotEstablished(_)
                | BridgeError::NotAllowed(_)
                | BridgeError::Malformed(_)
                | BridgeError::UnknownService(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_envelope_echoes_id() {
        let env = Envelope::status(Level::Error, "boom", Some(WireValue::from("req-1")));
        assert_eq!(env.op(), "status");
        assert_eq!(env.get("level").and_then(WireValue::as_str), Some("error"));
        assert_eq!(env.get("msg").and_then(WireValue::as_str), Some("boom"));
        assert_eq!(env.id_display(), "req-1");
    }

    #[test]
    fn envelope_requires_op() {
        let err = serde_json::from_str::<Envelope>(r#"{"topic": "/a"}"#);
        assert!(err.is_err());
        let err = serde_json::from_str::<Envelope>(r#"{"op": 3}"#);
        assert!(err.is_err());
    }

    #[test]
    fn envelope_json_roundtrip() {
        let env = Envelope::new("publish")
            .with("topic", "/chatter")
            .with("id", "p:1")
            .with("queue", 4i64);
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn typed_field_accessors() {
        let env: Envelope = serde_json::from_str(
            r#"{"op":"subscribe","topic":"/scan","throttle_rate":100,"latch":true,"type":7}"#,
        )
        .unwrap();
        assert_eq!(env.str_field("topic").unwrap(), "/scan");
        assert_eq!(env.opt_u64("throttle_rate").unwrap(), Some(100));
        assert_eq!(env.opt_bool("latch").unwrap(), Some(true));
        assert_eq!(env.opt_str("missing").unwrap(), None);
        assert!(matches!(
            env.str_field("missing"),
            Err(BridgeError::MissingField(_))
        ));
        assert!(matches!(
            env.opt_str("type"),
            Err(BridgeError::InvalidField { .. })
        ));
    }

    #[test]
    fn null_id_is_treated_as_absent() {
        let env: Envelope = serde_json::from_str(r#"{"op":"x","id":null}"#).unwrap();
        assert!(env.id().is_none());
    }

    #[test]
    fn protocol_error_classification() {
        assert!(BridgeError::UnknownOp("nope".into()).is_protocol_error());
        assert!(BridgeError::MissingField("topic".into()).is_protocol_error());
        assert!(!BridgeError::Serialization("x".into()).is_protocol_error());
        assert!(
            !BridgeError::Delivery {
                target: "t".into(),
                reason: "r".into()
            }
            .is_protocol_error()
        );
    }

    #[test]
    fn level_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Level::Warning).unwrap(), "\"warning\"");
    }
}
