//! Update sources polled by the notification engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use linkbridge_middleware::MessageSink;
use linkbridge_types::WireValue;
use parking_lot::Mutex;

/// One update ready to be encoded and delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// Identifies the producing source (the topic name for [`LatestValue`]).
    pub source: String,
    /// Monotonic version of this update; compared against target watermarks.
    pub watermark: u64,
    pub message: WireValue,
}

/// Something a delivery target can ask "anything newer than `since`?".
pub trait UpdateSource: Send + Sync {
    fn key(&self) -> &str;

    /// The newest update with a watermark greater than `since`, if any.
    fn poll(&self, since: u64) -> Option<Update>;
}

/// Keeps only the newest message of a topic.
///
/// Every [`LatestValue::update`] bumps the version, which serves as the
/// watermark.  Versions start at 1 so a fresh target (watermark 0) picks up
/// the first message.
pub struct LatestValue {
    key: String,
    version: AtomicU64,
    latest: Mutex<Option<(u64, WireValue)>>,
}

impl LatestValue {
    pub fn new(key: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            version: AtomicU64::new(0),
            latest: Mutex::new(None),
        })
    }

    /// Store `msg` as the newest value and return its version.
    pub fn update(&self, msg: WireValue) -> u64 {
        let mut latest = self.latest.lock();
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        *latest = Some((version, msg));
        version
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn latest(&self) -> Option<(u64, WireValue)> {
        self.latest.lock().clone()
    }

    /// A subscriber sink feeding this value, for use with
    /// `SubscriberRegistry::subscribe`.
    pub fn sink(self: &Arc<Self>) -> MessageSink {
        let this = Arc::clone(self);
        Arc::new(move |msg: WireValue| {
            this.update(msg);
        })
    }
}

impl UpdateSource for LatestValue {
    fn key(&self) -> &str {
        &self.key
    }

    fn poll(&self, since: u64) -> Option<Update> {
        let latest = self.latest.lock();
        match latest.as_ref() {
            Some((version, msg)) if *version > since => Some(Update {
                source: self.key.clone(),
                watermark: *version,
                message: msg.clone(),
            }),
            _ => None,
        }
    }
}
