//! The notification loop.
//!
//! While started, one background task repeats:
//!
//! 1. **Backpressure** – if more deliveries are in flight than
//!    `backpressure_multiplier × targets`, yield and skip this cycle.
//! 2. **Update hook** – run the optional per-cycle hook.
//! 3. **Snapshot** – copy the target list; registrations made during the
//!    cycle take effect on the next one.
//! 4. **Dispatch** – for every target with something newer than its
//!    watermark, encode (reusing an encoding made this cycle for the same
//!    source, watermark and content type) and hand the delivery to a
//!    semaphore-bounded task.
//!
//! Failed deliveries are logged; the target stays registered.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use linkbridge_middleware::WireFormat;
use linkbridge_middleware::codec;
use linkbridge_types::{BridgeError, Envelope};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::source::Update;
use crate::target::{DeliveryTarget, Payload};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Skip a cycle while pending deliveries exceed this many per target.
    pub backpressure_multiplier: usize,
    /// Pause between cycles.
    pub poll_interval: Duration,
    /// Deliveries allowed to run at once.
    pub max_concurrent_deliveries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backpressure_multiplier: 5,
            poll_interval: Duration::from_millis(10),
            max_concurrent_deliveries: 64,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Encoding
// ────────────────────────────────────────────────────────────────────────────

/// Turns an update into a body of the requested content type.
pub trait Encoder: Send + Sync {
    fn encode(&self, update: &Update, content_type: &str) -> Result<Payload, BridgeError>;
}

/// Encodes updates as `publish` envelopes in the protocol wire formats.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvelopeEncoder;

impl Encoder for EnvelopeEncoder {
    fn encode(&self, update: &Update, content_type: &str) -> Result<Payload, BridgeError> {
        let format = WireFormat::from_mime(content_type).ok_or_else(|| BridgeError::InvalidField {
            field: "content_type".into(),
            reason: format!("cannot encode updates as {content_type}"),
        })?;
        let envelope = Envelope::new("publish")
            .with("topic", update.source.as_str())
            .with("msg", update.message.clone());
        let frame = codec::encode(&envelope, format)?;
        Ok(Payload::new(format.mime(), frame.as_bytes().to_vec()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Engine
// ────────────────────────────────────────────────────────────────────────────

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// The cycle was skipped for backpressure.
    pub throttled: bool,
    pub dispatched: usize,
    pub encoded: usize,
}

pub type UpdateHook = Arc<dyn Fn() + Send + Sync>;

struct Shared {
    config: EngineConfig,
    encoder: Arc<dyn Encoder>,
    http: reqwest::Client,
    targets: RwLock<HashMap<String, Arc<DeliveryTarget>>>,
    update_hook: RwLock<Option<UpdateHook>>,
    permits: Arc<Semaphore>,
    pending: AtomicUsize,
    delivered: AtomicU64,
    failed: AtomicU64,
    stop: AtomicBool,
}

/// Decrements the pending counter however the delivery task ends.
struct PendingGuard(Arc<Shared>);

impl PendingGuard {
    fn new(shared: Arc<Shared>) -> Self {
        shared.pending.fetch_add(1, Ordering::AcqRel);
        Self(shared)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct NotificationEngine {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationEngine {
    pub fn new(config: EngineConfig, encoder: Arc<dyn Encoder>) -> Self {
        Self::with_http_client(config, encoder, reqwest::Client::new())
    }

    pub fn with_http_client(config: EngineConfig, encoder: Arc<dyn Encoder>, http: reqwest::Client) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_deliveries.max(1)));
        Self {
            shared: Arc::new(Shared {
                config,
                encoder,
                http,
                targets: RwLock::new(HashMap::new()),
                update_hook: RwLock::new(None),
                permits,
                pending: AtomicUsize::new(0),
                delivered: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                stop: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Spawn the background loop.  Does nothing if it is already running.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.shared.stop.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        *worker = Some(tokio::spawn(async move {
            info!(
                poll_interval_ms = shared.config.poll_interval.as_millis() as u64,
                max_concurrent = shared.config.max_concurrent_deliveries,
                "notification engine started"
            );
            while !shared.stop.load(Ordering::Acquire) {
                run_cycle(&shared).await;
                tokio::time::sleep(shared.config.poll_interval).await;
            }
            info!("notification engine stopped");
        }));
    }

    /// Ask the loop to stop and wait for it to finish its current cycle.
    /// Deliveries already handed out keep running.
    pub async fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!(error = %e, "notification loop ended abnormally");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Run a single cycle on the caller's task.
    pub async fn run_once(&self) -> CycleReport {
        run_cycle(&self.shared).await
    }

    pub fn set_update_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.shared.update_hook.write() = Some(Arc::new(hook));
    }

    pub fn register(&self, target: DeliveryTarget) -> Arc<DeliveryTarget> {
        let target = Arc::new(target);
        info!(
            target_id = target.id(),
            topic = target.topic(),
            kind = target.kind().name(),
            content_type = target.content_type(),
            "delivery target registered"
        );
        self.shared
            .targets
            .write()
            .insert(target.id().to_string(), Arc::clone(&target));
        target
    }

    /// Remove a target and run its removal hook.  `false` if unknown.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.shared.targets.write().remove(id);
        match removed {
            Some(target) => {
                target.retire();
                info!(target_id = id, topic = target.topic(), "delivery target removed");
                true
            }
            None => false,
        }
    }

    /// Remove every target owned by connection `client`.
    pub fn remove_targets_for(&self, client: u64) -> usize {
        let ids: Vec<String> = self
            .shared
            .targets
            .read()
            .values()
            .filter(|t| t.owner() == Some(client))
            .map(|t| t.id().to_string())
            .collect();
        ids.iter().filter(|id| self.unregister(id)).count()
    }

    pub fn get(&self, id: &str) -> Option<Arc<DeliveryTarget>> {
        self.shared.targets.read().get(id).cloned()
    }

    pub fn targets(&self) -> Vec<Arc<DeliveryTarget>> {
        self.shared.targets.read().values().cloned().collect()
    }

    pub fn targets_for(&self, topic: &str) -> Vec<Arc<DeliveryTarget>> {
        self.shared
            .targets
            .read()
            .values()
            .filter(|t| t.topic() == topic)
            .cloned()
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> u64 {
        self.shared.failed.load(Ordering::Acquire)
    }
}

impl Drop for NotificationEngine {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
    }
}

async fn run_cycle(shared: &Arc<Shared>) -> CycleReport {
    let mut report = CycleReport::default();

    let active = shared.targets.read().len();
    let pending = shared.pending.load(Ordering::Acquire);
    if pending > shared.config.backpressure_multiplier.saturating_mul(active) {
        debug!(pending, active, "deliveries backed up; skipping cycle");
        tokio::task::yield_now().await;
        report.throttled = true;
        return report;
    }

    let hook = shared.update_hook.read().clone();
    if let Some(hook) = hook {
        hook();
    }

    let snapshot: Vec<Arc<DeliveryTarget>> = shared.targets.read().values().cloned().collect();
    let mut cache: HashMap<(String, u64, String), Arc<Payload>> = HashMap::new();

    for target in snapshot {
        if !target.is_alive() {
            continue;
        }
        let Some(update) = target.poll() else {
            continue;
        };
        // The watermark moves before encoding, so an update that fails to
        // encode is skipped for good rather than retried every cycle.
        if !target.advance(update.watermark) {
            continue;
        }

        let key = (
            update.source.clone(),
            update.watermark,
            target.content_type().to_string(),
        );
        let payload = match cache.get(&key) {
            Some(payload) => Arc::clone(payload),
            None => match shared.encoder.encode(&update, target.content_type()) {
                Ok(payload) => {
                    report.encoded += 1;
                    let payload = Arc::new(payload);
                    cache.insert(key, Arc::clone(&payload));
                    payload
                }
                Err(e) => {
                    error!(
                        target_id = target.id(),
                        topic = target.topic(),
                        content_type = target.content_type(),
                        error = %e,
                        "cannot encode update"
                    );
                    continue;
                }
            },
        };

        submit(shared, target, payload);
        report.dispatched += 1;
    }
    report
}

fn submit(shared: &Arc<Shared>, target: Arc<DeliveryTarget>, payload: Arc<Payload>) {
    let guard = PendingGuard::new(Arc::clone(shared));
    tokio::spawn(async move {
        let shared = Arc::clone(&guard.0);
        let Ok(_permit) = Arc::clone(&shared.permits).acquire_owned().await else {
            return;
        };
        match target.deliver(&shared.http, &payload).await {
            Ok(()) => {
                shared.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(target_id = target.id(), topic = target.topic(), "update delivered");
            }
            Err(e) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                warn!(target_id = target.id(), topic = target.topic(), error = %e, "delivery failed");
            }
        }
        drop(guard);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::LatestValue;
    use linkbridge_middleware::Frame;
    use linkbridge_types::WireValue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Plain-text encoder that counts its calls.
    #[derive(Default)]
    struct CountingEncoder {
        calls: AtomicUsize,
    }

    impl Encoder for CountingEncoder {
        fn encode(&self, update: &Update, content_type: &str) -> Result<Payload, BridgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Payload::new(content_type, format!("{}={}", update.source, update.message)))
        }
    }

    fn engine_with(encoder: Arc<dyn Encoder>) -> NotificationEngine {
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .expect("http client");
        NotificationEngine::with_http_client(EngineConfig::default(), encoder, http)
    }

    async fn settle(engine: &NotificationEngine) {
        for _ in 0..200 {
            if engine.pending() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Accept one HTTP request, answer 204 and return its raw text.
    async fn record_one(listener: TcpListener) -> Result<String, std::io::Error> {
        let (mut stream, _) = listener.accept().await?;
        let mut raw = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= end + 4 + length {
                    break;
                }
            }
        }
        stream
            .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    #[tokio::test]
    async fn delivers_each_update_once() -> Result<(), Box<dyn std::error::Error>> {
        let engine = engine_with(Arc::new(CountingEncoder::default()));
        let source = LatestValue::new("/scan");
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.register(DeliveryTarget::push_socket("/scan", 1, tx, "text/plain", source.clone()));

        assert_eq!(engine.run_once().await.dispatched, 0);
        source.update(WireValue::Int(7));
        assert_eq!(engine.run_once().await.dispatched, 1);
        assert_eq!(engine.run_once().await.dispatched, 0);

        assert_eq!(rx.recv().await, Some(Frame::Text("/scan=7".into())));
        settle(&engine).await;
        assert_eq!(engine.delivered(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn encodings_are_shared_within_a_cycle() {
        let encoder = Arc::new(CountingEncoder::default());
        let engine = engine_with(encoder.clone());
        let source = LatestValue::new("/scan");
        let mut receivers = Vec::new();
        for (client, content_type) in [(1, "text/turtle"), (2, "text/turtle"), (3, "text/n3")] {
            let (tx, rx) = mpsc::unbounded_channel();
            receivers.push(rx);
            engine.register(DeliveryTarget::push_socket("/scan", client, tx, content_type, source.clone()));
        }
        source.update(WireValue::from("x"));

        let report = engine.run_once().await;
        assert_eq!(report.dispatched, 3);
        assert_eq!(report.encoded, 2);
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn backpressure_skips_the_cycle() {
        let engine = engine_with(Arc::new(CountingEncoder::default()));
        let source = LatestValue::new("/t");
        let (tx, _rx) = mpsc::unbounded_channel();
        engine.register(DeliveryTarget::push_socket("/t", 1, tx, "text/plain", source.clone()));
        source.update(WireValue::Int(1));

        engine.shared.pending.store(6, Ordering::SeqCst);
        let report = engine.run_once().await;
        assert!(report.throttled);
        assert_eq!(report.dispatched, 0);

        engine.shared.pending.store(5, Ordering::SeqCst);
        assert_eq!(engine.run_once().await.dispatched, 1);
    }

    #[tokio::test]
    async fn update_hook_runs_every_cycle() {
        let engine = engine_with(Arc::new(CountingEncoder::default()));
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&runs);
        engine.set_update_hook(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        engine.run_once().await;
        engine.run_once().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn webhook_posts_with_content_type() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}/hook", listener.local_addr()?);
        let recorder = tokio::spawn(record_one(listener));

        let engine = engine_with(Arc::new(EnvelopeEncoder));
        let source = LatestValue::new("/chatter");
        engine.register(DeliveryTarget::webhook("/chatter", url, "application/json", source.clone()));
        source.update(WireValue::from("hello"));
        assert_eq!(engine.run_once().await.dispatched, 1);

        let request = recorder.await??;
        assert!(request.starts_with("POST /hook"));
        assert!(request.to_ascii_lowercase().contains("content-type: application/json"));
        assert!(request.contains("\"hello\""));
        settle(&engine).await;
        assert_eq!(engine.delivered(), 1);
        assert_eq!(engine.pending(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_delivery_keeps_the_target() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}/gone", listener.local_addr()?);
        drop(listener);

        let engine = engine_with(Arc::new(CountingEncoder::default()));
        let source = LatestValue::new("/t");
        let target = engine.register(DeliveryTarget::webhook("/t", url, "text/plain", source.clone()));
        source.update(WireValue::Int(1));
        engine.run_once().await;
        settle(&engine).await;

        assert_eq!(engine.failed(), 1);
        assert_eq!(engine.pending(), 0);
        assert!(engine.get(target.id()).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn unregister_runs_hook_and_is_idempotent() {
        let engine = engine_with(Arc::new(CountingEncoder::default()));
        let removed = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&removed);
        let (tx, _rx) = mpsc::unbounded_channel();
        let target = engine.register(
            DeliveryTarget::push_socket("/t", 9, tx, "text/plain", LatestValue::new("/t")).with_on_remove(move || {
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(engine.unregister(target.id()));
        assert!(!engine.unregister(target.id()));
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_teardown_removes_its_targets() {
        let engine = engine_with(Arc::new(CountingEncoder::default()));
        let source = LatestValue::new("/t");
        for client in [1, 1, 2] {
            let (tx, _rx) = mpsc::unbounded_channel();
            engine.register(DeliveryTarget::push_socket("/t", client, tx, "text/plain", source.clone()));
        }
        engine.register(DeliveryTarget::webhook("/t", "http://127.0.0.1:1/", "text/plain", source));

        assert_eq!(engine.remove_targets_for(1), 2);
        assert_eq!(engine.remove_targets_for(1), 0);
        assert_eq!(engine.targets().len(), 2);
        assert_eq!(engine.targets_for("/t").len(), 2);
    }

    #[tokio::test]
    async fn background_loop_delivers_until_stopped() -> Result<(), Box<dyn std::error::Error>> {
        let engine = engine_with(Arc::new(CountingEncoder::default()));
        let source = LatestValue::new("/t");
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.register(DeliveryTarget::push_socket("/t", 1, tx, "text/plain", source.clone()));

        engine.start();
        assert!(engine.is_running());
        source.update(WireValue::Int(1));
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?;
        assert_eq!(frame, Some(Frame::Text("/t=1".into())));

        engine.stop().await;
        assert!(!engine.is_running());
        Ok(())
    }

    #[test]
    fn envelope_encoder_rejects_rdf_types() {
        let update = Update {
            source: "/t".into(),
            watermark: 1,
            message: WireValue::Int(1),
        };
        assert!(EnvelopeEncoder.encode(&update, "text/turtle").is_err());
        let payload = EnvelopeEncoder.encode(&update, "application/msgpack").expect("msgpack encodes");
        assert_eq!(payload.content_type, "application/msgpack");
    }
}
