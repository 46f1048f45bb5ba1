//! Subscriber-side records.
//!
//! A [`SubscriberRegistry`] keeps one subscription per topic.  Each
//! subscription installs a single bus callback and fans every message out to
//! its entries; each entry applies its own [`SubscriberOptions`].
//!
//! Throttling is trailing-edge: an entry with a non-zero `throttle_rate`
//! queues messages (at most `max(queue_length, 1)`, oldest dropped) and a
//! per-entry task flushes the queue when the throttle window closes.  Entries
//! without a throttle are delivered synchronously from the bus callback.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use linkbridge_types::{BridgeError, WireValue};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{Bus, BusCallback, BusHandle};
use crate::publishers::EntryKey;

/// Receives the messages delivered to one subscriber entry.
pub type MessageSink = Arc<dyn Fn(WireValue) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    /// Publish envelopes for this entry always use the binary container.
    MessagePack,
}

impl Compression {
    /// Parse the `compression` field; unknown values yield `None` so the
    /// caller can warn and fall back.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "none" => Some(Compression::None),
            "msgpack" => Some(Compression::MessagePack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriberOptions {
    pub throttle_rate: Duration,
    pub queue_length: usize,
    pub fragment_size: Option<usize>,
    pub compression: Compression,
}

// ---------------------------------------------------------------------------
// Per-entry delivery
// ---------------------------------------------------------------------------

struct ThrottleQueue {
    pending: Mutex<VecDeque<WireValue>>,
    capacity: usize,
    wake: Notify,
}

impl ThrottleQueue {
    fn push(&self, msg: WireValue) {
        {
            let mut pending = self.pending.lock();
            if pending.len() >= self.capacity {
                pending.pop_front();
            }
            pending.push_back(msg);
        }
        self.wake.notify_one();
    }
}

enum Delivery {
    Immediate(MessageSink),
    Throttled {
        queue: Arc<ThrottleQueue>,
        task: JoinHandle<()>,
    },
}

impl Delivery {
    fn build(options: &SubscriberOptions, sink: MessageSink) -> Result<Self, BridgeError> {
        if options.throttle_rate.is_zero() {
            return Ok(Delivery::Immediate(sink));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            BridgeError::Channel(format!("throttled subscriptions need a tokio runtime: {e}"))
        })?;
        let queue = Arc::new(ThrottleQueue {
            pending: Mutex::new(VecDeque::new()),
            capacity: options.queue_length.max(1),
            wake: Notify::new(),
        });
        let task = runtime.spawn(flush_loop(Arc::clone(&queue), options.throttle_rate, sink));
        Ok(Delivery::Throttled { queue, task })
    }

    fn deliver(&self, msg: WireValue) {
        match self {
            Delivery::Immediate(sink) => sink(msg),
            Delivery::Throttled { queue, .. } => queue.push(msg),
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Delivery::Throttled { task, .. } = self {
            task.abort();
        }
    }
}

async fn flush_loop(queue: Arc<ThrottleQueue>, window: Duration, sink: MessageSink) {
    loop {
        queue.wake.notified().await;
        tokio::time::sleep(window).await;
        let batch: Vec<WireValue> = queue.pending.lock().drain(..).collect();
        for msg in batch {
            sink(msg);
        }
    }
}

struct SubscriberEntry {
    options: SubscriberOptions,
    delivery: Arc<Delivery>,
}

type EntryMap = Arc<Mutex<HashMap<EntryKey, SubscriberEntry>>>;

struct Subscription {
    msg_type: String,
    handle: BusHandle,
    entries: EntryMap,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct SubscriberRegistry {
    bus: Arc<dyn Bus>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl SubscriberRegistry {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Add or replace the entry `key` on `topic`.
    ///
    /// The first entry installs the bus callback.  If the topic is latched
    /// its last message is replayed to the new entry.
    pub fn subscribe(
        &self,
        topic: &str,
        msg_type: Option<&str>,
        key: EntryKey,
        options: SubscriberOptions,
        sink: MessageSink,
    ) -> Result<(), BridgeError> {
        let delivery = Arc::new(Delivery::build(&options, sink)?);
        let requested = msg_type.filter(|t| !t.is_empty());

        {
            let mut subscriptions = self.subscriptions.lock();
            match subscriptions.get(topic) {
                Some(sub) => {
                    if let Some(requested) = requested
                        && requested != sub.msg_type
                    {
                        return Err(BridgeError::TypeConflict {
                            topic: topic.to_string(),
                            existing: sub.msg_type.clone(),
                            requested: requested.to_string(),
                        });
                    }
                }
                None => {
                    let resolved = match requested {
                        Some(t) => t.to_string(),
                        None => self
                            .bus
                            .topic_type(topic)
                            .ok_or_else(|| BridgeError::TopicNotEstablished(topic.to_string()))?,
                    };
                    let entries: EntryMap = Arc::new(Mutex::new(HashMap::new()));
                    let handle = self
                        .bus
                        .register_subscriber(topic, &resolved, fan_out(Arc::clone(&entries)))?;
                    info!(topic, msg_type = %resolved, "bus subscription installed");
                    subscriptions.insert(
                        topic.to_string(),
                        Subscription {
                            msg_type: resolved,
                            handle,
                            entries,
                        },
                    );
                }
            }

            let Some(sub) = subscriptions.get(topic) else {
                return Err(BridgeError::Channel(format!("subscription for {topic} vanished")));
            };
            debug!(
                topic,
                client_id = key.client,
                subscriber_id = %key.id,
                throttle_ms = options.throttle_rate.as_millis() as u64,
                "subscriber entry added"
            );
            sub.entries.lock().insert(
                key,
                SubscriberEntry {
                    options,
                    delivery: Arc::clone(&delivery),
                },
            );
        }

        if let Some(latched) = self.bus.latched_message(topic) {
            delivery.deliver(latched);
        }
        Ok(())
    }

    /// Remove the entry `key`; returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, topic: &str, key: &EntryKey) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let Some(sub) = subscriptions.get(topic) else {
            return false;
        };
        let now_empty = {
            let mut entries = sub.entries.lock();
            if entries.remove(key).is_none() {
                return false;
            }
            entries.is_empty()
        };
        if now_empty && let Some(sub) = subscriptions.remove(topic) {
            self.bus.unregister_subscriber(topic, sub.handle);
            info!(topic, "bus subscription removed");
        }
        true
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.lock().contains_key(topic)
    }

    pub fn entry_count(&self, topic: &str) -> usize {
        self.subscriptions
            .lock()
            .get(topic)
            .map_or(0, |sub| sub.entries.lock().len())
    }

    /// Options of one entry, if present.
    pub fn options(&self, topic: &str, key: &EntryKey) -> Option<SubscriberOptions> {
        self.subscriptions
            .lock()
            .get(topic)
            .and_then(|sub| sub.entries.lock().get(key).map(|e| e.options.clone()))
    }
}

/// The one bus callback of a subscription.
fn fan_out(entries: EntryMap) -> BusCallback {
    Arc::new(move |msg: &WireValue| {
        let targets: Vec<Arc<Delivery>> = entries
            .lock()
            .values()
            .map(|e| Arc::clone(&e.delivery))
            .collect();
        if targets.is_empty() {
            warn!("bus delivered to a subscription with no entries");
        }
        for target in targets {
            target.deliver(msg.clone());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;

    fn collector() -> (MessageSink, Arc<Mutex<Vec<WireValue>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let out = Arc::clone(&seen);
        let sink: MessageSink = Arc::new(move |msg| out.lock().push(msg));
        (sink, seen)
    }

    fn setup() -> Result<(Arc<LocalBus>, SubscriberRegistry), BridgeError> {
        let bus = Arc::new(LocalBus::new());
        bus.register_publisher("/scan", "sensor_msgs/LaserScan", false, 10)?;
        let reg = SubscriberRegistry::new(bus.clone());
        Ok((bus, reg))
    }

    #[test]
    fn one_bus_callback_fans_out() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, reg) = setup()?;
        let (s1, seen1) = collector();
        let (s2, seen2) = collector();
        reg.subscribe("/scan", None, EntryKey::new(1, "a"), SubscriberOptions::default(), s1)?;
        reg.subscribe("/scan", None, EntryKey::new(2, "b"), SubscriberOptions::default(), s2)?;
        assert_eq!(bus.subscriber_count("/scan"), 1);

        bus.publish("/scan", WireValue::Int(5))?;
        assert_eq!(seen1.lock().as_slice(), &[WireValue::Int(5)]);
        assert_eq!(seen2.lock().as_slice(), &[WireValue::Int(5)]);
        Ok(())
    }

    #[test]
    fn last_unsubscribe_tears_down() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, reg) = setup()?;
        let (s, _) = collector();
        reg.subscribe("/scan", None, EntryKey::new(1, "a"), SubscriberOptions::default(), s.clone())?;
        reg.subscribe("/scan", None, EntryKey::new(1, "b"), SubscriberOptions::default(), s)?;

        assert!(reg.unsubscribe("/scan", &EntryKey::new(1, "a")));
        assert_eq!(bus.subscriber_count("/scan"), 1);
        assert!(reg.unsubscribe("/scan", &EntryKey::new(1, "b")));
        assert_eq!(bus.subscriber_count("/scan"), 0);
        assert!(!reg.is_subscribed("/scan"));

        assert!(!reg.unsubscribe("/scan", &EntryKey::new(1, "b")));
        assert!(!reg.unsubscribe("/scan", &EntryKey::new(1, "b")));
        Ok(())
    }

    #[test]
    fn unknown_topic_needs_a_type() -> Result<(), Box<dyn std::error::Error>> {
        let (_bus, reg) = setup()?;
        let (s, _) = collector();
        let err = reg.subscribe("/ghost", None, EntryKey::new(1, "a"), SubscriberOptions::default(), s.clone());
        assert!(matches!(err, Err(BridgeError::TopicNotEstablished(_))));
        reg.subscribe("/ghost", Some("std_msgs/Empty"), EntryKey::new(1, "a"), SubscriberOptions::default(), s)?;
        assert!(reg.is_subscribed("/ghost"));
        Ok(())
    }

    #[test]
    fn latched_message_is_replayed_to_new_entry() -> Result<(), Box<dyn std::error::Error>> {
        let bus = Arc::new(LocalBus::new());
        bus.register_publisher("/map", "nav_msgs/OccupancyGrid", true, 1)?;
        bus.publish("/map", WireValue::from("grid"))?;
        let reg = SubscriberRegistry::new(bus.clone());
        let (s, seen) = collector();
        reg.subscribe("/map", None, EntryKey::new(1, "m"), SubscriberOptions::default(), s)?;
        assert_eq!(seen.lock().as_slice(), &[WireValue::from("grid")]);
        Ok(())
    }

    #[tokio::test]
    async fn throttle_keeps_latest_within_window() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, reg) = setup()?;
        let (s, seen) = collector();
        let options = SubscriberOptions {
            throttle_rate: Duration::from_millis(100),
            ..Default::default()
        };
        reg.subscribe("/scan", None, EntryKey::new(1, "t"), options, s)?;

        bus.publish("/scan", WireValue::Int(1))?;
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.publish("/scan", WireValue::Int(2))?;
        assert!(seen.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(seen.lock().as_slice(), &[WireValue::Int(2)]);
        Ok(())
    }

    #[tokio::test]
    async fn queue_length_bounds_throttled_backlog() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, reg) = setup()?;
        let (s, seen) = collector();
        let options = SubscriberOptions {
            throttle_rate: Duration::from_millis(50),
            queue_length: 2,
            ..Default::default()
        };
        reg.subscribe("/scan", None, EntryKey::new(1, "q"), options, s)?;
        for i in 0..5 {
            bus.publish("/scan", WireValue::Int(i))?;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(seen.lock().as_slice(), &[WireValue::Int(3), WireValue::Int(4)]);
        Ok(())
    }

    #[test]
    fn throttle_without_runtime_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let (_bus, reg) = setup()?;
        let (s, _) = collector();
        let options = SubscriberOptions {
            throttle_rate: Duration::from_millis(10),
            ..Default::default()
        };
        let err = reg.subscribe("/scan", None, EntryKey::new(1, "t"), options, s);
        assert!(matches!(err, Err(BridgeError::Channel(_))));
        assert!(!reg.is_subscribed("/scan"));
        Ok(())
    }

    #[test]
    fn compression_parsing() {
        assert_eq!(Compression::parse("none"), Some(Compression::None));
        assert_eq!(Compression::parse("msgpack"), Some(Compression::MessagePack));
        assert_eq!(Compression::parse("png"), None);
    }
}
