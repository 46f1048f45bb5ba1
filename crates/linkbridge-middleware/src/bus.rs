//! The pub/sub bus the bridge fronts.
//!
//! The bridge never talks to a concrete middleware directly; it goes through
//! the narrow [`Bus`] trait.  [`LocalBus`] is the in-process implementation
//! used by the `linkbridge` binary and by every test in the workspace.
//!
//! | Method | Purpose |
//! |---|---|
//! | [`Bus::topics`] / [`Bus::topic_type`] | topic discovery |
//! | [`Bus::register_publisher`] / [`Bus::unregister_publisher`] | publisher lifecycle |
//! | [`Bus::publish`] | push one message to every subscriber |
//! | [`Bus::register_subscriber`] / [`Bus::unregister_subscriber`] | install / remove one callback |
//! | [`Bus::latched_message`] | last message of a latched topic |
//! | [`Bus::services`] / [`Bus::call_service`] | request/response services |

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use linkbridge_types::{BridgeError, WireValue};
use parking_lot::RwLock;
use tracing::debug;

/// Callback invoked once per message published on a topic.
pub type BusCallback = Arc<dyn Fn(&WireValue) + Send + Sync>;

/// In-process service implementation served by [`LocalBus`].
pub type ServiceHandler =
    Arc<dyn Fn(WireValue) -> BoxFuture<'static, Result<WireValue, BridgeError>> + Send + Sync>;

/// Identifies one installed subscriber callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusHandle(u64);

#[async_trait]
pub trait Bus: Send + Sync {
    fn topics(&self) -> Vec<String>;

    fn topic_type(&self, topic: &str) -> Option<String>;

    /// Register one publisher on `topic`, establishing its type if new.
    fn register_publisher(
        &self,
        topic: &str,
        msg_type: &str,
        latch: bool,
        queue_size: usize,
    ) -> Result<(), BridgeError>;

    fn unregister_publisher(&self, topic: &str);

    fn publish(&self, topic: &str, msg: WireValue) -> Result<(), BridgeError>;

    /// Install `callback` for every future message on `topic`.
    fn register_subscriber(
        &self,
        topic: &str,
        msg_type: &str,
        callback: BusCallback,
    ) -> Result<BusHandle, BridgeError>;

    fn unregister_subscriber(&self, topic: &str, handle: BusHandle);

    fn latched_message(&self, topic: &str) -> Option<WireValue>;

    fn services(&self) -> Vec<String>;

    fn service_type(&self, service: &str) -> Option<String>;

    async fn call_service(&self, service: &str, args: WireValue) -> Result<WireValue, BridgeError>;
}

// ---------------------------------------------------------------------------
// LocalBus
// ---------------------------------------------------------------------------

struct TopicState {
    msg_type: String,
    publishers: usize,
    latch: bool,
    latched: Option<WireValue>,
    subscribers: Vec<(BusHandle, BusCallback)>,
}

impl TopicState {
    fn new(msg_type: &str) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            publishers: 0,
            latch: false,
            latched: None,
            subscribers: Vec::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.publishers == 0 && self.subscribers.is_empty()
    }
}

struct ServiceState {
    srv_type: String,
    handler: ServiceHandler,
}

/// In-process [`Bus`].
///
/// Delivery is synchronous: [`Bus::publish`] snapshots the subscriber list
/// under the lock and then invokes every callback on the caller's thread
/// with the lock released.
#[derive(Default)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, TopicState>>,
    services: RwLock<HashMap<String, ServiceState>>,
    next_handle: AtomicU64,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `service` in-process with `handler`.
    pub fn provide_service<F, Fut>(&self, service: &str, srv_type: &str, handler: F)
    where
        F: Fn(WireValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WireValue, BridgeError>> + Send + 'static,
    {
        let handler: ServiceHandler = Arc::new(
            move |args: WireValue| -> BoxFuture<'static, Result<WireValue, BridgeError>> {
                Box::pin(handler(args))
            },
        );
        self.services.write().insert(
            service.to_string(),
            ServiceState {
                srv_type: srv_type.to_string(),
                handler,
            },
        );
    }

    pub fn remove_service(&self, service: &str) -> bool {
        self.services.write().remove(service).is_some()
    }

    pub fn publisher_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, |t| t.publishers)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, |t| t.subscribers.len())
    }
}

#[async_trait]
impl Bus for LocalBus {
    fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn topic_type(&self, topic: &str) -> Option<String> {
        self.topics.read().get(topic).map(|t| t.msg_type.clone())
    }

    fn register_publisher(
        &self,
        topic: &str,
        msg_type: &str,
        latch: bool,
        queue_size: usize,
    ) -> Result<(), BridgeError> {
        let mut topics = self.topics.write();
        match topics.get(topic) {
            Some(state) if !msg_type.is_empty() && state.msg_type != msg_type => {
                return Err(BridgeError::TypeConflict {
                    topic: topic.to_string(),
                    existing: state.msg_type.clone(),
                    requested: msg_type.to_string(),
                });
            }
            None if msg_type.is_empty() => {
                return Err(BridgeError::TopicNotEstablished(topic.to_string()));
            }
            _ => {}
        }
        let state = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(msg_type));
        state.publishers += 1;
        state.latch |= latch;
        debug!(topic, msg_type = %state.msg_type, latch, queue_size, "publisher registered");
        Ok(())
    }

    fn unregister_publisher(&self, topic: &str) {
        let mut topics = self.topics.write();
        let Some(state) = topics.get_mut(topic) else {
            return;
        };
        state.publishers = state.publishers.saturating_sub(1);
        if state.publishers == 0 {
            state.latch = false;
            state.latched = None;
        }
        if state.is_idle() {
            topics.remove(topic);
        }
        debug!(topic, "publisher unregistered");
    }

    fn publish(&self, topic: &str, msg: WireValue) -> Result<(), BridgeError> {
        let callbacks: Vec<BusCallback> = {
            let mut topics = self.topics.write();
            let state = topics
                .get_mut(topic)
                .ok_or_else(|| BridgeError::TopicNotEstablished(topic.to_string()))?;
            if state.latch {
                state.latched = Some(msg.clone());
            }
            state.subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for cb in callbacks {
            cb(&msg);
        }
        Ok(())
    }

    fn register_subscriber(
        &self,
        topic: &str,
        msg_type: &str,
        callback: BusCallback,
    ) -> Result<BusHandle, BridgeError> {
        let handle = BusHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut topics = self.topics.write();
        match topics.get_mut(topic) {
            Some(state) => {
                if !msg_type.is_empty() && state.msg_type != msg_type {
                    return Err(BridgeError::TypeConflict {
                        topic: topic.to_string(),
                        existing: state.msg_type.clone(),
                        requested: msg_type.to_string(),
                    });
                }
                state.subscribers.push((handle, callback));
            }
            None => {
                if msg_type.is_empty() {
                    return Err(BridgeError::TopicNotEstablished(topic.to_string()));
                }
                let mut state = TopicState::new(msg_type);
                state.subscribers.push((handle, callback));
                topics.insert(topic.to_string(), state);
            }
        }
        Ok(handle)
    }

    fn unregister_subscriber(&self, topic: &str, handle: BusHandle) {
        let mut topics = self.topics.write();
        let Some(state) = topics.get_mut(topic) else {
            return;
        };
        state.subscribers.retain(|(h, _)| *h != handle);
        if state.is_idle() {
            topics.remove(topic);
        }
    }

    fn latched_message(&self, topic: &str) -> Option<WireValue> {
        self.topics.read().get(topic).and_then(|t| t.latched.clone())
    }

    fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn service_type(&self, service: &str) -> Option<String> {
        self.services.read().get(service).map(|s| s.srv_type.clone())
    }

    async fn call_service(&self, service: &str, args: WireValue) -> Result<WireValue, BridgeError> {
        let handler = self
            .services
            .read()
            .get(service)
            .map(|s| Arc::clone(&s.handler))
            .ok_or_else(|| BridgeError::UnknownService(service.to_string()))?;
        handler(args).await
    }
}
