//! Per-connection protocol state and the shared [`Bridge`] context.
//!
//! Every transport connection owns one [`Protocol`].  Inbound frames go
//! through [`Protocol::incoming`] (decode, buffer partial input) and
//! [`Protocol::dispatch`] (route by `op` to a [`Capability`]).  Handler
//! failures become `status` envelopes on the same connection; they never
//! close it.
//!
//! [`Protocol::destroy`] runs exactly once, on explicit teardown or on drop,
//! and releases everything the connection owns: fragment buffers,
//! advertisements, subscriber entries, provided services, and whatever the
//! bridge's teardown hooks clean up (e.g. push-socket delivery targets).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use linkbridge_types::{BridgeError, Envelope, Level, WireValue};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::access::NameFilter;
use crate::bus::Bus;
use crate::capability::Capability;
use crate::codec::{Codec, DecodeError, Frame, WireFormat};
use crate::counter::AtomicCounter;
use crate::fragment::{DEFAULT_FRAGMENT_TIMEOUT, Defragmenter};
use crate::outlet::Outlet;
use crate::publishers::{EntryKey, PublisherRegistry};
use crate::services::ServiceRegistry;
use crate::subscribers::SubscriberRegistry;

/// Settings every connection of a bridge shares.
#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    /// Outgoing frames above this size are fragmented.
    pub fragment_size: Option<usize>,
    /// Inbound frames (and buffered partial input) above this size are
    /// rejected.
    pub max_message_size: Option<usize>,
    pub binary_only: bool,
    pub fragment_timeout: Duration,
    pub topics: NameFilter,
    pub services: NameFilter,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            fragment_size: None,
            max_message_size: None,
            binary_only: false,
            fragment_timeout: DEFAULT_FRAGMENT_TIMEOUT,
            topics: NameFilter::allow_all(),
            services: NameFilter::allow_all(),
        }
    }
}

/// Called with the client id of every destroyed connection.
pub type TeardownHook = Arc<dyn Fn(u64) + Send + Sync>;

/// State shared by every connection: the bus, the registries and the id
/// source.
pub struct Bridge {
    bus: Arc<dyn Bus>,
    ids: Arc<AtomicCounter>,
    publishers: PublisherRegistry,
    subscribers: SubscriberRegistry,
    services: ServiceRegistry,
    defragmenter: Defragmenter,
    settings: ProtocolSettings,
    teardown: RwLock<Vec<TeardownHook>>,
}

impl Bridge {
    pub fn new(bus: Arc<dyn Bus>, ids: Arc<AtomicCounter>, settings: ProtocolSettings) -> Arc<Self> {
        Arc::new(Self {
            publishers: PublisherRegistry::new(Arc::clone(&bus)),
            subscribers: SubscriberRegistry::new(Arc::clone(&bus)),
            services: ServiceRegistry::new(),
            defragmenter: Defragmenter::new(settings.fragment_timeout)
                .with_limit(settings.max_message_size),
            bus,
            ids,
            settings,
            teardown: RwLock::new(Vec::new()),
        })
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    pub fn ids(&self) -> &Arc<AtomicCounter> {
        &self.ids
    }

    pub fn publishers(&self) -> &PublisherRegistry {
        &self.publishers
    }

    pub fn subscribers(&self) -> &SubscriberRegistry {
        &self.subscribers
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn defragmenter(&self) -> &Defragmenter {
        &self.defragmenter
    }

    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    pub fn codec(&self) -> Codec {
        Codec::new(self.settings.binary_only)
    }

    /// Register a hook run for every destroyed connection.
    pub fn on_teardown(&self, hook: TeardownHook) {
        self.teardown.write().push(hook);
    }

    /// Open a connection with the full capability set.
    pub fn connect(self: &Arc<Self>, format: WireFormat) -> (Protocol, mpsc::UnboundedReceiver<Frame>) {
        self.connect_with(format, &Capability::ALL)
    }

    /// Open a connection limited to `capabilities`.  Later entries win when
    /// two capabilities claim the same op.
    pub fn connect_with(
        self: &Arc<Self>,
        format: WireFormat,
        capabilities: &[Capability],
    ) -> (Protocol, mpsc::UnboundedReceiver<Frame>) {
        let id = self.ids.next_id();
        let (outlet, rx) = Outlet::channel(id, self.codec(), format, self.settings.fragment_size);
        (Protocol::new(Arc::clone(self), id, outlet, capabilities), rx)
    }
}

#[derive(Default)]
struct OwnedRecords {
    advertised: HashSet<(String, String)>,
    subscribed: HashSet<(String, String)>,
}

#[derive(Default)]
struct InputBuffer {
    text: String,
    binary: Vec<u8>,
}

pub struct Protocol {
    id: u64,
    bridge: Arc<Bridge>,
    outlet: Outlet,
    handlers: HashMap<&'static str, Capability>,
    owned: Mutex<OwnedRecords>,
    input: Mutex<InputBuffer>,
    destroyed: AtomicBool,
}

impl Protocol {
    pub fn new(bridge: Arc<Bridge>, id: u64, outlet: Outlet, capabilities: &[Capability]) -> Self {
        let mut handlers = HashMap::new();
        for cap in capabilities {
            for op in cap.ops() {
                handlers.insert(*op, *cap);
            }
        }
        info!(client_id = id, capabilities = capabilities.len(), "client connected");
        Self {
            id,
            bridge,
            outlet,
            handlers,
            owned: Mutex::new(OwnedRecords::default()),
            input: Mutex::new(InputBuffer::default()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub fn outlet(&self) -> &Outlet {
        &self.outlet
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Decode one inbound frame and dispatch it.
    ///
    /// Input that ends mid-value is kept and retried with the next frame of
    /// the same kind, up to `max_message_size`.
    pub fn incoming(&self, frame: Frame) {
        if self.is_destroyed() {
            return;
        }
        if let Some(max) = self.bridge.settings.max_message_size
            && frame.len() > max
        {
            self.report_error(
                &BridgeError::Malformed(format!("message of {} bytes exceeds limit of {max}", frame.len())),
                None,
            );
            return;
        }

        let codec = self.bridge.codec();
        let buffered = self.take_buffered(&frame);
        let outcome = match buffered {
            Some(joined) => match codec.deserialize(&joined) {
                // The buffered prefix may be junk; give the new frame a
                // chance on its own.
                Err(DecodeError::Malformed(_)) => codec.deserialize(&frame).map_err(|e| (e, frame)),
                other => other.map_err(|e| (e, joined)),
            },
            None => codec.deserialize(&frame).map_err(|e| (e, frame)),
        };

        match outcome {
            Ok(envelope) => self.dispatch(envelope),
            Err((DecodeError::Incomplete, pending)) => self.buffer(pending),
            Err((DecodeError::Malformed(reason), _)) => {
                self.report_error(&BridgeError::Malformed(reason), None);
            }
        }
    }

    fn take_buffered(&self, frame: &Frame) -> Option<Frame> {
        let mut input = self.input.lock();
        match frame {
            Frame::Text(t) if !input.text.is_empty() => {
                let mut joined = std::mem::take(&mut input.text);
                joined.push_str(t);
                Some(Frame::Text(joined))
            }
            Frame::Binary(b) if !input.binary.is_empty() => {
                let mut joined = std::mem::take(&mut input.binary);
                joined.extend_from_slice(b);
                Some(Frame::Binary(joined))
            }
            _ => None,
        }
    }

    fn buffer(&self, pending: Frame) {
        if let Some(max) = self.bridge.settings.max_message_size
            && pending.len() > max
        {
            self.report_error(
                &BridgeError::Malformed(format!(
                    "incomplete message grew past limit of {max} bytes; discarded"
                )),
                None,
            );
            return;
        }
        debug!(client_id = self.id, buffered = pending.len(), "waiting for the rest of a message");
        let mut input = self.input.lock();
        match pending {
            Frame::Text(t) => input.text = t,
            Frame::Binary(b) => input.binary = b,
        }
    }

    /// Route `envelope` to the capability registered for its `op`.
    pub fn dispatch(&self, envelope: Envelope) {
        if self.is_destroyed() {
            return;
        }
        let Some(capability) = self.handlers.get(envelope.op()).copied() else {
            self.report_error(&BridgeError::UnknownOp(envelope.op().to_string()), Some(&envelope));
            return;
        };
        if let Err(e) = capability.handle(self, &envelope) {
            self.report_error(&e, Some(&envelope));
        }
    }

    fn report_error(&self, e: &BridgeError, envelope: Option<&Envelope>) {
        let op = envelope.map(Envelope::op).unwrap_or_default();
        let id = envelope.map(Envelope::id_display).unwrap_or_default();
        if e.is_protocol_error() {
            warn!(client_id = self.id, op, id = %id, error = %e, "request rejected");
        } else {
            error!(client_id = self.id, op, id = %id, error = %e, "request failed");
        }
        let msg = if op.is_empty() {
            e.to_string()
        } else {
            format!("{op}: {e}")
        };
        self.send(&Envelope::status(
            Level::Error,
            msg,
            envelope.and_then(Envelope::id).cloned(),
        ));
    }

    /// Queue `envelope` for this connection.
    pub fn send(&self, envelope: &Envelope) -> bool {
        self.outlet.send(envelope)
    }

    /// Send a `status` envelope at `level`.
    pub fn log(&self, level: Level, msg: impl Into<String>, id: Option<WireValue>) {
        let msg: String = msg.into();
        match level {
            Level::Error => error!(client_id = self.id, "{msg}"),
            Level::Warning => warn!(client_id = self.id, "{msg}"),
            Level::Info => info!(client_id = self.id, "{msg}"),
        }
        self.send(&Envelope::status(level, msg, id));
    }

    // -----------------------------------------------------------------------
    // Ownership bookkeeping used by the capabilities
    // -----------------------------------------------------------------------

    pub(crate) fn entry_key(&self, id: &str) -> EntryKey {
        EntryKey::new(self.id, id)
    }

    pub(crate) fn record_advertisement(&self, topic: &str, id: &str) {
        self.owned
            .lock()
            .advertised
            .insert((topic.to_string(), id.to_string()));
    }

    pub(crate) fn forget_advertisement(&self, topic: &str, id: &str) {
        self.owned
            .lock()
            .advertised
            .remove(&(topic.to_string(), id.to_string()));
    }

    pub(crate) fn record_subscription(&self, topic: &str, id: &str) {
        self.owned
            .lock()
            .subscribed
            .insert((topic.to_string(), id.to_string()));
    }

    pub(crate) fn forget_subscription(&self, topic: &str, id: &str) {
        self.owned
            .lock()
            .subscribed
            .remove(&(topic.to_string(), id.to_string()));
    }

    /// Topics this connection currently advertises or subscribes to.
    pub fn owned_topics(&self) -> (Vec<String>, Vec<String>) {
        let owned = self.owned.lock();
        let mut advertised: Vec<String> = owned.advertised.iter().map(|(t, _)| t.clone()).collect();
        let mut subscribed: Vec<String> = owned.subscribed.iter().map(|(t, _)| t.clone()).collect();
        advertised.sort();
        advertised.dedup();
        subscribed.sort();
        subscribed.dedup();
        (advertised, subscribed)
    }

    /// Release everything this connection owns.  Safe to call repeatedly;
    /// only the first call does any work.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let bridge = &self.bridge;
        let dropped_fragments = bridge.defragmenter.discard_connection(self.id);

        let owned = std::mem::take(&mut *self.owned.lock());
        for (topic, id) in &owned.advertised {
            bridge.publishers.unadvertise(topic, &self.entry_key(id));
        }
        for (topic, id) in &owned.subscribed {
            bridge.subscribers.unsubscribe(topic, &self.entry_key(id));
        }
        let services = bridge.services.remove_client(self.id);
        let abandoned_calls = bridge.services.discard_caller(self.id);

        let hooks: Vec<TeardownHook> = bridge.teardown.read().clone();
        for hook in hooks {
            hook(self.id);
        }
        info!(
            client_id = self.id,
            advertisements = owned.advertised.len(),
            subscriptions = owned.subscribed.len(),
            services = services.len(),
            abandoned_calls,
            dropped_fragments,
            "client disconnected"
        );
    }
}

impl Drop for Protocol {
    fn drop(&mut self) {
        self.destroy();
    }
}
