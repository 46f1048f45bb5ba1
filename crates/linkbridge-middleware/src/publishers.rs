//! Publisher-side registrations.
//!
//! One [`Registration`] exists per advertised topic.  It holds one
//! advertisement entry per (connection, advertise id) and owns exactly one
//! bus publisher registration, created with the first entry and released
//! with the last.

use std::collections::HashMap;
use std::sync::Arc;

use linkbridge_types::{BridgeError, WireValue};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::bus::Bus;

/// Advertise id used when a `publish` implicitly advertises a topic.
pub const AUTO_ADVERTISE_ID: &str = "publish:auto";

/// Default publisher queue size when the client does not send one.
pub const DEFAULT_QUEUE_SIZE: usize = 100;

/// Identifies one logical entry: the owning connection plus the id the
/// client chose for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub client: u64,
    pub id: String,
}

impl EntryKey {
    pub fn new(client: u64, id: impl Into<String>) -> Self {
        Self {
            client,
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advertisement {
    pub latch: bool,
    pub queue_size: usize,
}

#[derive(Debug)]
pub struct Registration {
    msg_type: String,
    entries: HashMap<EntryKey, Advertisement>,
}

impl Registration {
    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct PublisherRegistry {
    bus: Arc<dyn Bus>,
    registrations: Mutex<HashMap<String, Registration>>,
}

impl PublisherRegistry {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            registrations: Mutex::new(HashMap::new()),
        }
    }

    /// Add or replace the entry `key` on `topic`.
    ///
    /// The first entry registers the topic with the bus.  `msg_type` may be
    /// omitted when the bus already knows the topic.
    pub fn advertise(
        &self,
        topic: &str,
        msg_type: Option<&str>,
        key: EntryKey,
        latch: bool,
        queue_size: usize,
    ) -> Result<(), BridgeError> {
        let mut registrations = self.registrations.lock();
        let advertisement = Advertisement { latch, queue_size };

        if let Some(reg) = registrations.get_mut(topic) {
            if let Some(requested) = msg_type.filter(|t| !t.is_empty())
                && requested != reg.msg_type
            {
                return Err(BridgeError::TypeConflict {
                    topic: topic.to_string(),
                    existing: reg.msg_type.clone(),
                    requested: requested.to_string(),
                });
            }
            debug!(topic, client_id = key.client, advertise_id = %key.id, "advertisement added");
            reg.entries.insert(key, advertisement);
            return Ok(());
        }

        let resolved = match msg_type.filter(|t| !t.is_empty()) {
            Some(t) => t.to_string(),
            None => self
                .bus
                .topic_type(topic)
                .ok_or_else(|| BridgeError::TopicNotEstablished(topic.to_string()))?,
        };
        self.bus
            .register_publisher(topic, &resolved, latch, queue_size)?;
        info!(topic, msg_type = %resolved, client_id = key.client, "topic advertised");

        let mut entries = HashMap::new();
        entries.insert(key, advertisement);
        registrations.insert(
            topic.to_string(),
            Registration {
                msg_type: resolved,
                entries,
            },
        );
        Ok(())
    }

    /// Remove the entry `key`; returns `false` if it was not advertised.
    pub fn unadvertise(&self, topic: &str, key: &EntryKey) -> bool {
        let mut registrations = self.registrations.lock();
        let Some(reg) = registrations.get_mut(topic) else {
            return false;
        };
        if reg.entries.remove(key).is_none() {
            return false;
        }
        if reg.is_empty() {
            registrations.remove(topic);
            self.bus.unregister_publisher(topic);
            info!(topic, "topic unadvertised");
        }
        true
    }

    /// `true` when `client` holds at least one entry on `topic`.
    pub fn has_client(&self, topic: &str, client: u64) -> bool {
        self.registrations
            .lock()
            .get(topic)
            .is_some_and(|reg| reg.entries.keys().any(|k| k.client == client))
    }

    pub fn is_advertised(&self, topic: &str) -> bool {
        self.registrations.lock().contains_key(topic)
    }

    pub fn entry_count(&self, topic: &str) -> usize {
        self.registrations.lock().get(topic).map_or(0, Registration::len)
    }

    pub fn msg_type(&self, topic: &str) -> Option<String> {
        self.registrations
            .lock()
            .get(topic)
            .map(|reg| reg.msg_type.clone())
    }

    /// Publish `msg` on behalf of `client`, advertising the topic first
    /// (with [`AUTO_ADVERTISE_ID`]) when `client` has not done so.
    ///
    /// Returns `true` when an implicit advertisement was created, so the
    /// caller can record it for teardown.
    pub fn publish(&self, topic: &str, client: u64, latch: bool, msg: WireValue) -> Result<bool, BridgeError> {
        let mut auto = false;
        if !self.has_client(topic, client) {
            self.advertise(
                topic,
                None,
                EntryKey::new(client, AUTO_ADVERTISE_ID),
                latch,
                DEFAULT_QUEUE_SIZE,
            )?;
            auto = true;
        }
        self.bus.publish(topic, msg)?;
        Ok(auto)
    }
}
