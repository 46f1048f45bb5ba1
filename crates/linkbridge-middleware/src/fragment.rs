//! Fragmentation and reassembly.
//!
//! A fragment travels as its own envelope:
//!
//! ```text
//! {"op": "fragment", "id": "<fragmentation id>", "data": <chunk>, "num": i, "total": N}
//! ```
//!
//! `data` is a string slice of a text frame or a byte chunk of a binary one.
//! [`Defragmenter`] collects chunks per (connection id, fragmentation id) in
//! indexed slots; the frame is rebuilt exactly once, when every index
//! `0..N` has arrived, and the buffer is dropped at that moment.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use linkbridge_types::{BridgeError, Envelope, WireValue};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::Frame;

/// Unclaimed buffers are dropped after this long.
pub const DEFAULT_FRAGMENT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Text(String),
    Binary(Vec<u8>),
}

impl Chunk {
    fn is_binary(&self) -> bool {
        matches!(self, Chunk::Binary(_))
    }

    fn len(&self) -> usize {
        match self {
            Chunk::Text(s) => s.len(),
            Chunk::Binary(b) => b.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub id: String,
    pub index: usize,
    pub total: usize,
    pub chunk: Chunk,
}

impl Fragment {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, BridgeError> {
        let id = match envelope.id() {
            Some(WireValue::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => return Err(BridgeError::MissingField("id".into())),
        };
        let index = envelope
            .opt_u64("num")?
            .ok_or_else(|| BridgeError::MissingField("num".into()))? as usize;
        let total = envelope
            .opt_u64("total")?
            .ok_or_else(|| BridgeError::MissingField("total".into()))? as usize;
        if total == 0 {
            return Err(BridgeError::InvalidField {
                field: "total".into(),
                reason: "must be at least 1".into(),
            });
        }
        if index >= total {
            return Err(BridgeError::InvalidField {
                field: "num".into(),
                reason: format!("index {index} out of range for total {total}"),
            });
        }
        let chunk = match envelope.get("data") {
            Some(WireValue::String(s)) => Chunk::Text(s.clone()),
            Some(WireValue::Bytes(b)) => Chunk::Binary(b.clone()),
            Some(other) => {
                return Err(BridgeError::InvalidField {
                    field: "data".into(),
                    reason: format!("expected string or bytes, got {}", other.kind()),
                });
            }
            None => return Err(BridgeError::MissingField("data".into())),
        };
        Ok(Self {
            id,
            index,
            total,
            chunk,
        })
    }

    pub fn to_envelope(&self) -> Envelope {
        let data = match &self.chunk {
            Chunk::Text(s) => WireValue::String(s.clone()),
            Chunk::Binary(b) => WireValue::Bytes(b.clone()),
        };
        Envelope::new("fragment")
            .with("id", self.id.as_str())
            .with("data", data)
            .with("num", self.index)
            .with("total", self.total)
    }
}

/// Split `frame` into fragments of at most `size` bytes.
///
/// Text is cut on character boundaries, so a chunk may come out shorter
/// than `size` (never empty).  A `size` of zero yields a single fragment.
pub fn fragment(frame: &Frame, id: &str, size: usize) -> Vec<Fragment> {
    let chunks: Vec<Chunk> = match frame {
        Frame::Binary(bytes) if size > 0 => bytes
            .chunks(size)
            .map(|c| Chunk::Binary(c.to_vec()))
            .collect(),
        Frame::Binary(bytes) => vec![Chunk::Binary(bytes.clone())],
        Frame::Text(text) => split_text(text, size)
            .into_iter()
            .map(|s| Chunk::Text(s.to_string()))
            .collect(),
    };
    let total = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| Fragment {
            id: id.to_string(),
            index,
            total,
            chunk,
        })
        .collect()
}

fn split_text(text: &str, size: usize) -> Vec<&str> {
    if size == 0 || text.len() <= size {
        return vec![text];
    }
    let mut parts = Vec::with_capacity(text.len() / size + 1);
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + size).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // A single character wider than `size`.
            end = start + text[start..].chars().next().map_or(1, char::len_utf8);
        }
        parts.push(&text[start..end]);
        start = end;
    }
    parts
}

// ---------------------------------------------------------------------------
// Reassembly
// ---------------------------------------------------------------------------

struct FragmentBuffer {
    total: usize,
    binary: bool,
    parts: BTreeMap<usize, Chunk>,
    bytes: usize,
    touched: Instant,
}

impl FragmentBuffer {
    fn assemble(self) -> Frame {
        if self.binary {
            let mut out = Vec::new();
            for chunk in self.parts.into_values() {
                if let Chunk::Binary(b) = chunk {
                    out.extend_from_slice(&b);
                }
            }
            Frame::Binary(out)
        } else {
            let mut out = String::new();
            for chunk in self.parts.into_values() {
                if let Chunk::Text(s) = chunk {
                    out.push_str(&s);
                }
            }
            Frame::Text(out)
        }
    }
}

/// Reassembly buffers shared by every connection of one bridge.
pub struct Defragmenter {
    buffers: Mutex<HashMap<(u64, String), FragmentBuffer>>,
    timeout: Duration,
    max_bytes: Option<usize>,
}

impl Default for Defragmenter {
    fn default() -> Self {
        Self::new(DEFAULT_FRAGMENT_TIMEOUT)
    }
}

impl Defragmenter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            timeout,
            max_bytes: None,
        }
    }

    /// Cap the bytes buffered for one fragmentation id.
    pub fn with_limit(mut self, max_bytes: Option<usize>) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Store one fragment for `client_id`.
    ///
    /// Returns the rebuilt frame when this fragment completes its set.  A
    /// repeated index overwrites the earlier chunk.  A set that grows past
    /// the byte limit is dropped and reported as an error.
    pub fn accept(&self, client_id: u64, fragment: Fragment) -> Result<Option<Frame>, BridgeError> {
        self.reclaim_expired();

        let key = (client_id, fragment.id.clone());
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(key.clone()).or_insert_with(|| FragmentBuffer {
            total: fragment.total,
            binary: fragment.chunk.is_binary(),
            parts: BTreeMap::new(),
            bytes: 0,
            touched: Instant::now(),
        });

        if buffer.total != fragment.total {
            return Err(BridgeError::InvalidField {
                field: "total".into(),
                reason: format!(
                    "fragment {} declared total {} but {} was announced first",
                    fragment.id, fragment.total, buffer.total
                ),
            });
        }
        if buffer.binary != fragment.chunk.is_binary() {
            return Err(BridgeError::InvalidField {
                field: "data".into(),
                reason: format!("fragment {} mixes text and binary chunks", fragment.id),
            });
        }

        buffer.touched = Instant::now();
        buffer.bytes += fragment.chunk.len();
        if let Some(old) = buffer.parts.insert(fragment.index, fragment.chunk) {
            buffer.bytes -= old.len();
        }
        if let Some(max) = self.max_bytes
            && buffer.bytes > max
        {
            let buffered = buffer.bytes;
            buffers.remove(&key);
            warn!(client_id, fragment_id = %fragment.id, buffered, max, "fragment set too large, dropped");
            return Err(BridgeError::InvalidField {
                field: "data".into(),
                reason: format!("fragment {} exceeds {max} bytes", fragment.id),
            });
        }
        debug!(
            client_id,
            fragment_id = %fragment.id,
            received = buffer.parts.len(),
            total = buffer.total,
            "fragment stored"
        );

        if buffer.parts.len() < buffer.total {
            return Ok(None);
        }
        Ok(buffers.remove(&key).map(FragmentBuffer::assemble))
    }

    /// Drop every buffer of `client_id`.  Returns how many were discarded.
    pub fn discard_connection(&self, client_id: u64) -> usize {
        let mut buffers = self.buffers.lock();
        let before = buffers.len();
        buffers.retain(|(owner, _), _| *owner != client_id);
        let dropped = before - buffers.len();
        if dropped > 0 {
            debug!(client_id, dropped, "discarded incomplete fragment buffers");
        }
        dropped
    }

    /// Drop buffers not touched within the timeout.
    pub fn reclaim_expired(&self) -> usize {
        let timeout = self.timeout;
        let mut buffers = self.buffers.lock();
        let before = buffers.len();
        buffers.retain(|(client_id, id), buf| {
            let keep = buf.touched.elapsed() < timeout;
            if !keep {
                warn!(
                    client_id = *client_id,
                    fragment_id = %id,
                    received = buf.parts.len(),
                    total = buf.total,
                    "fragment buffer timed out"
                );
            }
            keep
        });
        before - buffers.len()
    }

    /// Number of incomplete buffers.
    pub fn pending(&self) -> usize {
        self.buffers.lock().len()
    }
}
