//! Delivery targets: where encoded updates end up.
//!
//! | Kind | Transport |
//! |---|---|
//! | [`TargetKind::Webhook`] | HTTP `POST` of the encoded body to a callback URL |
//! | [`TargetKind::PushSocket`] | a frame queued on an open WebSocket connection |

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use linkbridge_middleware::Frame;
use linkbridge_types::BridgeError;
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::source::{Update, UpdateSource};

/// An encoded update body.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub content_type: String,
    pub body: Vec<u8>,
}

impl Payload {
    pub fn new(content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    /// Text frame when the body is UTF-8, binary otherwise.
    pub fn to_frame(&self) -> Frame {
        match std::str::from_utf8(&self.body) {
            Ok(text) => Frame::Text(text.to_string()),
            Err(_) => Frame::Binary(self.body.clone()),
        }
    }
}

pub enum TargetKind {
    Webhook { callback_url: String },
    PushSocket { tx: mpsc::UnboundedSender<Frame> },
}

impl TargetKind {
    pub fn name(&self) -> &'static str {
        match self {
            TargetKind::Webhook { .. } => "webhook",
            TargetKind::PushSocket { .. } => "websocket",
        }
    }
}

type RemoveHook = Box<dyn FnOnce() + Send>;

/// One registered consumer of a topic's updates.
///
/// The watermark only ever moves forward; a target emits a delivery when its
/// source has something newer than the watermark.
pub struct DeliveryTarget {
    id: String,
    topic: String,
    owner: Option<u64>,
    content_type: String,
    kind: TargetKind,
    source: Arc<dyn UpdateSource>,
    watermark: AtomicU64,
    alive: AtomicBool,
    created_at: DateTime<Utc>,
    on_remove: Mutex<Option<RemoveHook>>,
}

impl DeliveryTarget {
    fn new(
        topic: &str,
        owner: Option<u64>,
        content_type: &str,
        kind: TargetKind,
        source: Arc<dyn UpdateSource>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            owner,
            content_type: content_type.to_string(),
            kind,
            source,
            watermark: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            created_at: Utc::now(),
            on_remove: Mutex::new(None),
        }
    }

    pub fn webhook(
        topic: &str,
        callback_url: impl Into<String>,
        content_type: &str,
        source: Arc<dyn UpdateSource>,
    ) -> Self {
        let kind = TargetKind::Webhook {
            callback_url: callback_url.into(),
        };
        Self::new(topic, None, content_type, kind, source)
    }

    /// A target feeding the connection `owner`; it goes away with the
    /// connection.
    pub fn push_socket(
        topic: &str,
        owner: u64,
        tx: mpsc::UnboundedSender<Frame>,
        content_type: &str,
        source: Arc<dyn UpdateSource>,
    ) -> Self {
        Self::new(topic, Some(owner), content_type, TargetKind::PushSocket { tx }, source)
    }

    /// Run `hook` once when the target is unregistered.
    pub fn with_on_remove(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *self.on_remove.lock() = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn owner(&self) -> Option<u64> {
        self.owner
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn kind(&self) -> &TargetKind {
        &self.kind
    }

    pub fn callback_url(&self) -> Option<&str> {
        match &self.kind {
            TargetKind::Webhook { callback_url } => Some(callback_url),
            TargetKind::PushSocket { .. } => None,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Anything newer than the watermark?
    pub fn poll(&self) -> Option<Update> {
        self.source.poll(self.watermark())
    }

    /// Move the watermark to `to`.  Returns `false` if it was already there
    /// or beyond, in which case another cycle claimed the update.
    pub(crate) fn advance(&self, to: u64) -> bool {
        self.watermark.fetch_max(to, Ordering::AcqRel) < to
    }

    /// Mark dead and run the removal hook.  Only the first call does
    /// anything.
    pub(crate) fn retire(&self) -> bool {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(hook) = self.on_remove.lock().take() {
            hook();
        }
        true
    }

    pub async fn deliver(&self, http: &reqwest::Client, payload: &Payload) -> Result<(), BridgeError> {
        match &self.kind {
            TargetKind::Webhook { callback_url } => {
                let failed = |e: reqwest::Error| BridgeError::Delivery {
                    target: callback_url.clone(),
                    reason: e.to_string(),
                };
                http.post(callback_url)
                    .header(CONTENT_TYPE, payload.content_type.as_str())
                    .body(payload.body.clone())
                    .send()
                    .await
                    .map_err(failed)?
                    .error_for_status()
                    .map_err(failed)?;
                Ok(())
            }
            TargetKind::PushSocket { tx } => tx.send(payload.to_frame()).map_err(|_| BridgeError::Delivery {
                target: self.id.clone(),
                reason: "push socket closed".into(),
            }),
        }
    }
}

impl fmt::Debug for DeliveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryTarget")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("kind", &self.kind.name())
            .field("owner", &self.owner)
            .field("content_type", &self.content_type)
            .field("watermark", &self.watermark())
            .finish()
    }
}
