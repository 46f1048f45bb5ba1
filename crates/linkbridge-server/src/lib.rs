//! `linkbridge-server` – the network surfaces of the bridge.
//!
//! - [`ws`] – the WebSocket acceptor.  `/` speaks the envelope protocol;
//!   `/lrtws/topics/<name>` additionally owns a push-socket delivery target
//!   for that topic.
//! - [`resource`] – the resource-oriented HTTP surface under `/lrt`.
//! - [`rdf`] – RDF graphs, media types and the message mapping both
//!   surfaces use.
//!
//! Both surfaces share one [`BridgeHub`]: the protocol [`Bridge`], the
//! [`NotificationEngine`] and the per-topic feeds behind delivery targets.

pub mod rdf;
pub mod resource;
pub mod ws;

use std::sync::{Arc, Weak};
use std::time::Duration;

use linkbridge_middleware::{Bridge, Frame};
use linkbridge_notify::{DeliveryTarget, EngineConfig, NotificationEngine, TopicFeeds};
use linkbridge_types::BridgeError;
use tokio::sync::mpsc;

pub use resource::ResourceSurface;
pub use ws::WsServer;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub address: String,
    /// WebSocket port.
    pub port: u16,
    /// Port of the `/lrt` HTTP surface.
    pub resource_port: u16,
    /// Pause after each outgoing WebSocket frame.
    pub delay_between_messages: Duration,
    /// Close connections that stay silent this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9090,
            resource_port: 8080,
            delay_between_messages: Duration::ZERO,
            idle_timeout: None,
        }
    }
}

pub struct BridgeHub {
    bridge: Arc<Bridge>,
    engine: Arc<NotificationEngine>,
    feeds: Arc<TopicFeeds>,
    settings: ServerSettings,
}

impl BridgeHub {
    /// Wire a notification engine to `bridge`.  Connection teardown removes
    /// the targets the connection owned.
    pub fn new(bridge: Arc<Bridge>, engine: EngineConfig, settings: ServerSettings) -> Arc<Self> {
        let engine = Arc::new(NotificationEngine::new(engine, Arc::new(rdf::RdfEncoder)));
        let feeds = Arc::new(TopicFeeds::new(Arc::clone(&bridge)));

        let weak: Weak<NotificationEngine> = Arc::downgrade(&engine);
        bridge.on_teardown(Arc::new(move |client| {
            if let Some(engine) = weak.upgrade() {
                engine.remove_targets_for(client);
            }
        }));

        Arc::new(Self {
            bridge,
            engine,
            feeds,
            settings,
        })
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub fn engine(&self) -> &Arc<NotificationEngine> {
        &self.engine
    }

    pub fn feeds(&self) -> &Arc<TopicFeeds> {
        &self.feeds
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn subscribe_webhook(
        &self,
        topic: &str,
        callback_url: &str,
        content_type: &str,
    ) -> Result<Arc<DeliveryTarget>, BridgeError> {
        let source = self.feeds.acquire(topic)?;
        let target = DeliveryTarget::webhook(topic, callback_url, content_type, source);
        Ok(self.register(target))
    }

    /// A target pushing `topic` to connection `owner` through `tx`.
    pub fn subscribe_push(
        &self,
        topic: &str,
        owner: u64,
        tx: mpsc::UnboundedSender<Frame>,
        content_type: &str,
    ) -> Result<Arc<DeliveryTarget>, BridgeError> {
        let source = self.feeds.acquire(topic)?;
        let target = DeliveryTarget::push_socket(topic, owner, tx, content_type, source);
        Ok(self.register(target))
    }

    fn register(&self, target: DeliveryTarget) -> Arc<DeliveryTarget> {
        let feeds = Arc::clone(&self.feeds);
        let topic = target.topic().to_string();
        self.engine
            .register(target.with_on_remove(move || feeds.release(&topic)))
    }
}
