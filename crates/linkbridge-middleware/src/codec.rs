//! Envelope codec.
//!
//! Two wire formats are supported:
//!
//! | Format | Frame | Notes |
//! |---|---|---|
//! | [`WireFormat::Json`] | text | default; cannot carry raw bytes or non-finite floats |
//! | [`WireFormat::MessagePack`] | binary | used whenever an envelope holds bytes, or the connection is binary-only |
//!
//! [`Codec::serialize`] never fails loudly: a value that cannot be encoded is
//! logged with the envelope's correlation id and the message is dropped.
//! [`Codec::deserialize`] separates input that merely ended too early
//! ([`DecodeError::Incomplete`]) from input that is wrong
//! ([`DecodeError::Malformed`]) so the caller can keep buffering.

use std::io::ErrorKind;

use linkbridge_types::{BridgeError, Envelope};
use thiserror::Error;
use tracing::error;

use crate::negotiate::requires_binary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
    Json,
    MessagePack,
}

impl WireFormat {
    /// Every supported format in preference order.
    pub const ALL: [WireFormat; 2] = [WireFormat::Json, WireFormat::MessagePack];

    pub fn mime(&self) -> &'static str {
        match self {
            WireFormat::Json => "application/json",
            WireFormat::MessagePack => "application/msgpack",
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "application/json" => Some(WireFormat::Json),
            "application/msgpack" | "application/x-msgpack" => Some(WireFormat::MessagePack),
            _ => None,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, WireFormat::MessagePack)
    }
}

/// One transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(s) => s.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Frame::Binary(_))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Text(s) => s.as_bytes(),
            Frame::Binary(b) => b,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    /// Input ended in the middle of a value; more bytes may complete it.
    #[error("incomplete input")]
    Incomplete,
    #[error("malformed input: {0}")]
    Malformed(String),
}

impl From<DecodeError> for BridgeError {
    fn from(e: DecodeError) -> Self {
        BridgeError::Malformed(e.to_string())
    }
}

/// Encode `envelope` in exactly `format`.
pub fn encode(envelope: &Envelope, format: WireFormat) -> Result<Frame, BridgeError> {
    match format {
        WireFormat::Json => serde_json::to_string(envelope)
            .map(Frame::Text)
            .map_err(|e| BridgeError::Serialization(e.to_string())),
        WireFormat::MessagePack => rmp_serde::to_vec(envelope)
            .map(Frame::Binary)
            .map_err(|e| BridgeError::Serialization(e.to_string())),
    }
}

/// Decode `bytes` as exactly `format`.
pub fn decode(bytes: &[u8], format: WireFormat) -> Result<Envelope, DecodeError> {
    match format {
        WireFormat::Json => serde_json::from_slice(bytes).map_err(|e| {
            if e.is_eof() {
                DecodeError::Incomplete
            } else {
                DecodeError::Malformed(e.to_string())
            }
        }),
        WireFormat::MessagePack => rmp_serde::from_slice(bytes).map_err(|e| match e {
            rmp_serde::decode::Error::InvalidMarkerRead(ref io)
            | rmp_serde::decode::Error::InvalidDataRead(ref io)
                if io.kind() == ErrorKind::UnexpectedEof =>
            {
                DecodeError::Incomplete
            }
            other => DecodeError::Malformed(other.to_string()),
        }),
    }
}

/// Per-connection codec policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    binary_only: bool,
}

impl Codec {
    pub fn new(binary_only: bool) -> Self {
        Self { binary_only }
    }

    pub fn binary_only(&self) -> bool {
        self.binary_only
    }

    /// The format `envelope` will actually travel in when `preferred` was
    /// negotiated.
    pub fn select_format(&self, envelope: &Envelope, preferred: WireFormat) -> WireFormat {
        if self.binary_only || requires_binary(envelope) {
            WireFormat::MessagePack
        } else {
            preferred
        }
    }

    /// Encode for the wire; `None` means "do not send".
    pub fn serialize(&self, envelope: &Envelope, preferred: WireFormat) -> Option<Frame> {
        let format = self.select_format(envelope, preferred);
        match encode(envelope, format) {
            Ok(frame) => Some(frame),
            Err(e) => {
                error!(
                    op = envelope.op(),
                    id = %envelope.id_display(),
                    format = ?format,
                    error = %e,
                    "failed to serialize outgoing message"
                );
                None
            }
        }
    }

    /// Decode an inbound frame: text as JSON, binary as MessagePack, and
    /// everything as MessagePack in binary-only mode.
    pub fn deserialize(&self, frame: &Frame) -> Result<Envelope, DecodeError> {
        decode(frame.as_bytes(), self.frame_format(frame))
    }

    pub fn frame_format(&self, frame: &Frame) -> WireFormat {
        if self.binary_only || frame.is_binary() {
            WireFormat::MessagePack
        } else {
            WireFormat::Json
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkbridge_types::{WireMap, WireValue};
    use proptest::prelude::*;

    fn sample() -> Envelope {
        let mut msg = WireMap::new();
        msg.insert("data".into(), WireValue::from("hello"));
        msg.insert("seq".into(), WireValue::Int(3));
        Envelope::new("publish")
            .with("topic", "/chatter")
            .with("msg", WireValue::Map(msg))
            .with("id", "publish:/chatter:1")
    }

    #[test]
    fn json_roundtrip_without_bytes() -> Result<(), Box<dyn std::error::Error>> {
        let codec = Codec::default();
        let env = sample();
        let frame = codec.serialize(&env, WireFormat::Json).ok_or("dropped")?;
        assert!(matches!(frame, Frame::Text(_)));
        assert_eq!(codec.deserialize(&frame)?, env);
        Ok(())
    }

    #[test]
    fn bytes_force_binary_container() -> Result<(), Box<dyn std::error::Error>> {
        let codec = Codec::default();
        let env = sample().with("raw", WireValue::bytes(vec![0u8, 1, 2, 255]));
        let frame = codec.serialize(&env, WireFormat::Json).ok_or("dropped")?;
        assert!(frame.is_binary());
        assert_eq!(codec.deserialize(&frame)?, env);
        Ok(())
    }

    #[test]
    fn bytes_do_not_survive_json() -> Result<(), Box<dyn std::error::Error>> {
        let env = Envelope::new("publish").with("raw", WireValue::bytes(vec![7u8]));
        let frame = encode(&env, WireFormat::Json)?;
        let back = decode(frame.as_bytes(), WireFormat::Json)?;
        assert_ne!(back, env);
        Ok(())
    }

    #[test]
    fn binary_only_mode_pins_everything() -> Result<(), Box<dyn std::error::Error>> {
        let codec = Codec::new(true);
        let frame = codec.serialize(&sample(), WireFormat::Json).ok_or("dropped")?;
        assert!(frame.is_binary());
        assert_eq!(codec.frame_format(&Frame::Text("{}".into())), WireFormat::MessagePack);
        Ok(())
    }

    #[test]
    fn unserializable_value_is_dropped() {
        let env = Envelope::new("publish").with("x", WireValue::Float(f64::NAN));
        assert!(Codec::default().serialize(&env, WireFormat::Json).is_none());
    }

    #[test]
    fn truncated_json_is_incomplete() {
        let codec = Codec::default();
        let err = codec.deserialize(&Frame::Text(r#"{"op": "publish", "top"#.into()));
        assert_eq!(err, Err(DecodeError::Incomplete));
    }

    #[test]
    fn garbage_json_is_malformed() {
        let codec = Codec::default();
        assert!(matches!(
            codec.deserialize(&Frame::Text("{]".into())),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            codec.deserialize(&Frame::Text(r#"{"topic": "/a"}"#.into())),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn truncated_msgpack_is_incomplete() -> Result<(), Box<dyn std::error::Error>> {
        let frame = encode(&sample(), WireFormat::MessagePack)?;
        let bytes = frame.as_bytes();
        let cut = Frame::Binary(bytes[..bytes.len() / 2].to_vec());
        assert_eq!(Codec::default().deserialize(&cut), Err(DecodeError::Incomplete));
        Ok(())
    }

    #[test]
    fn mime_mapping() {
        assert_eq!(WireFormat::from_mime("application/x-msgpack"), Some(WireFormat::MessagePack));
        assert_eq!(WireFormat::from_mime("text/turtle"), None);
        assert_eq!(WireFormat::Json.mime(), "application/json");
    }

    /// Value trees both containers can carry.  Floats are quarters so the
    /// text form parses back to the same bits.
    fn text_safe_value() -> impl Strategy<Value = WireValue> {
        let leaf = prop_oneof![
            Just(WireValue::Null),
            any::<bool>().prop_map(WireValue::Bool),
            any::<i64>().prop_map(WireValue::Int),
            (i64::MAX as u64 + 1..=u64::MAX).prop_map(WireValue::UInt),
            (-1_000_000i32..1_000_000).prop_map(|q| WireValue::Float(f64::from(q) / 4.0)),
            ".{0,12}".prop_map(WireValue::String),
        ];
        leaf.prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(WireValue::Array),
                prop::collection::btree_map("[a-z_]{1,8}", inner, 0..6).prop_map(WireValue::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn byte_free_envelopes_survive_both_containers(msg in text_safe_value()) {
            let env = Envelope::new("publish").with("topic", "/t").with("msg", msg);
            for format in [WireFormat::Json, WireFormat::MessagePack] {
                let frame = Codec::default().serialize(&env, format).unwrap();
                prop_assert_eq!(frame.is_binary(), format.is_binary());
                prop_assert_eq!(Codec::default().deserialize(&frame).unwrap(), env.clone());
            }
        }

        #[test]
        fn bytes_survive_only_the_binary_container(
            msg in text_safe_value(),
            raw in prop::collection::vec(any::<u8>(), 0..64),
        ) {
            let env = Envelope::new("publish").with("msg", msg).with("raw", WireValue::bytes(raw));

            let frame = Codec::default().serialize(&env, WireFormat::Json).unwrap();
            prop_assert!(frame.is_binary());
            prop_assert_eq!(Codec::default().deserialize(&frame).unwrap(), env.clone());

            let text = encode(&env, WireFormat::Json).unwrap();
            prop_assert_ne!(decode(text.as_bytes(), WireFormat::Json).unwrap(), env);
        }
    }
}
