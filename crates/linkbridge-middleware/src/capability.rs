//! Opcode handlers.
//!
//! | Capability | Ops |
//! |---|---|
//! | [`Capability::Advertise`] | `advertise`, `unadvertise` |
//! | [`Capability::Publish`] | `publish` |
//! | [`Capability::Subscribe`] | `subscribe`, `unsubscribe` |
//! | [`Capability::CallService`] | `call_service` |
//! | [`Capability::AdvertiseService`] | `advertise_service` |
//! | [`Capability::UnadvertiseService`] | `unadvertise_service` |
//! | [`Capability::ServiceResponse`] | `service_response` |
//! | [`Capability::Defragment`] | `fragment` |

use std::sync::Arc;
use std::time::Duration;

use linkbridge_types::{BridgeError, Envelope, WireValue};
use tracing::{debug, warn};

use crate::fragment::Fragment;
use crate::outlet::Outlet;
use crate::protocol::Protocol;
use crate::publishers::{AUTO_ADVERTISE_ID, DEFAULT_QUEUE_SIZE};
use crate::services::ServiceReply;
use crate::subscribers::{Compression, MessageSink, SubscriberOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Advertise,
    Publish,
    Subscribe,
    CallService,
    AdvertiseService,
    UnadvertiseService,
    ServiceResponse,
    Defragment,
}

impl Capability {
    /// The default capability set, in registration order.
    pub const ALL: [Capability; 8] = [
        Capability::Advertise,
        Capability::Publish,
        Capability::Subscribe,
        Capability::CallService,
        Capability::AdvertiseService,
        Capability::UnadvertiseService,
        Capability::ServiceResponse,
        Capability::Defragment,
    ];

    pub fn ops(&self) -> &'static [&'static str] {
        match self {
            Capability::Advertise => &["advertise", "unadvertise"],
            Capability::Publish => &["publish"],
            Capability::Subscribe => &["subscribe", "unsubscribe"],
            Capability::CallService => &["call_service"],
            Capability::AdvertiseService => &["advertise_service"],
            Capability::UnadvertiseService => &["unadvertise_service"],
            Capability::ServiceResponse => &["service_response"],
            Capability::Defragment => &["fragment"],
        }
    }

    pub fn handle(&self, protocol: &Protocol, envelope: &Envelope) -> Result<(), BridgeError> {
        match (self, envelope.op()) {
            (Capability::Advertise, "advertise") => advertise(protocol, envelope),
            (Capability::Advertise, "unadvertise") => unadvertise(protocol, envelope),
            (Capability::Publish, _) => publish(protocol, envelope),
            (Capability::Subscribe, "subscribe") => subscribe(protocol, envelope),
            (Capability::Subscribe, "unsubscribe") => unsubscribe(protocol, envelope),
            (Capability::CallService, _) => call_service(protocol, envelope),
            (Capability::AdvertiseService, _) => advertise_service(protocol, envelope),
            (Capability::UnadvertiseService, _) => unadvertise_service(protocol, envelope),
            (Capability::ServiceResponse, _) => service_response(protocol, envelope),
            (Capability::Defragment, _) => defragment(protocol, envelope),
            (_, op) => Err(BridgeError::UnknownOp(op.to_string())),
        }
    }
}

/// The client-chosen entry id; absent ids share the empty key.
fn entry_id(envelope: &Envelope) -> String {
    envelope.id_display()
}

fn checked_topic<'a>(protocol: &Protocol, envelope: &'a Envelope) -> Result<&'a str, BridgeError> {
    let topic = envelope.str_field("topic")?;
    protocol.bridge().settings().topics.check(topic)?;
    Ok(topic)
}

fn checked_service<'a>(protocol: &Protocol, envelope: &'a Envelope) -> Result<&'a str, BridgeError> {
    let service = envelope.str_field("service")?;
    protocol.bridge().settings().services.check(service)?;
    Ok(service)
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

fn advertise(protocol: &Protocol, envelope: &Envelope) -> Result<(), BridgeError> {
    let topic = checked_topic(protocol, envelope)?;
    let msg_type = envelope.str_field("type")?;
    let latch = envelope.opt_bool("latch")?.unwrap_or(false);
    let queue_size = envelope
        .opt_u64("queue_size")?
        .map_or(DEFAULT_QUEUE_SIZE, |q| q as usize);
    let id = entry_id(envelope);

    protocol.bridge().publishers().advertise(
        topic,
        Some(msg_type),
        protocol.entry_key(&id),
        latch,
        queue_size,
    )?;
    protocol.record_advertisement(topic, &id);
    Ok(())
}

fn unadvertise(protocol: &Protocol, envelope: &Envelope) -> Result<(), BridgeError> {
    let topic = checked_topic(protocol, envelope)?;
    let id = entry_id(envelope);
    if protocol
        .bridge()
        .publishers()
        .unadvertise(topic, &protocol.entry_key(&id))
    {
        protocol.forget_advertisement(topic, &id);
    } else {
        debug!(client_id = protocol.id(), topic, "unadvertise of a topic not advertised");
    }
    Ok(())
}

fn publish(protocol: &Protocol, envelope: &Envelope) -> Result<(), BridgeError> {
    let topic = checked_topic(protocol, envelope)?;
    let latch = envelope.opt_bool("latch")?.unwrap_or(false);
    let msg = envelope.get("msg").cloned().unwrap_or_else(WireValue::map);

    let auto = protocol
        .bridge()
        .publishers()
        .publish(topic, protocol.id(), latch, msg)?;
    if auto {
        protocol.record_advertisement(topic, AUTO_ADVERTISE_ID);
    }
    Ok(())
}

fn subscribe(protocol: &Protocol, envelope: &Envelope) -> Result<(), BridgeError> {
    let topic = checked_topic(protocol, envelope)?;
    let msg_type = envelope.opt_str("type")?;
    let id = entry_id(envelope);

    let compression = match envelope.opt_str("compression")? {
        None => Compression::None,
        Some(name) => Compression::parse(name).unwrap_or_else(|| {
            warn!(client_id = protocol.id(), topic, compression = name, "unknown compression; using none");
            Compression::None
        }),
    };
    let options = SubscriberOptions {
        throttle_rate: Duration::from_millis(envelope.opt_u64("throttle_rate")?.unwrap_or(0)),
        queue_length: envelope.opt_u64("queue_length")?.unwrap_or(0) as usize,
        fragment_size: envelope.opt_u64("fragment_size")?.map(|s| s as usize),
        compression,
    };

    let sink = publish_sink(protocol.outlet().clone(), topic, &options);
    protocol
        .bridge()
        .subscribers()
        .subscribe(topic, msg_type, protocol.entry_key(&id), options, sink)?;
    protocol.record_subscription(topic, &id);
    Ok(())
}

/// Wrap each delivered message in a `publish` envelope for this connection.
fn publish_sink(outlet: Outlet, topic: &str, options: &SubscriberOptions) -> MessageSink {
    let topic = topic.to_string();
    let fragment_size = options.fragment_size;
    let force_binary = options.compression == Compression::MessagePack;
    Arc::new(move |msg: WireValue| {
        let envelope = Envelope::new("publish")
            .with("topic", topic.as_str())
            .with("msg", msg);
        outlet.send_with(&envelope, fragment_size, force_binary);
    })
}

fn unsubscribe(protocol: &Protocol, envelope: &Envelope) -> Result<(), BridgeError> {
    let topic = checked_topic(protocol, envelope)?;
    let id = entry_id(envelope);
    if protocol
        .bridge()
        .subscribers()
        .unsubscribe(topic, &protocol.entry_key(&id))
    {
        protocol.forget_subscription(topic, &id);
    } else {
        debug!(client_id = protocol.id(), topic, "unsubscribe of a topic not subscribed");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

fn call_service(protocol: &Protocol, envelope: &Envelope) -> Result<(), BridgeError> {
    let service = checked_service(protocol, envelope)?.to_string();
    let args = envelope.get("args").cloned().unwrap_or_else(WireValue::map);
    let id = envelope.id().cloned();
    let outlet = protocol.outlet().clone();
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| BridgeError::Channel(format!("service calls need a tokio runtime: {e}")))?;

    let services = protocol.bridge().services();
    if let Some(reply) = services.route_call(&service, protocol.id(), args.clone())? {
        runtime.spawn(async move {
            let reply = reply
                .await
                .unwrap_or_else(|_| ServiceReply::failed("service provider went away"));
            send_service_response(&outlet, &service, id, reply);
        });
        return Ok(());
    }

    let bus = Arc::clone(protocol.bridge().bus());
    if bus.service_type(&service).is_none() {
        return Err(BridgeError::UnknownService(service));
    }
    runtime.spawn(async move {
        let reply = match bus.call_service(&service, args).await {
            Ok(values) => ServiceReply::ok(values),
            Err(e) => {
                warn!(service = %service, error = %e, "service call failed");
                ServiceReply::failed(e.to_string())
            }
        };
        send_service_response(&outlet, &service, id, reply);
    });
    Ok(())
}

fn send_service_response(outlet: &Outlet, service: &str, id: Option<WireValue>, reply: ServiceReply) {
    let mut envelope = Envelope::new("service_response")
        .with("service", service)
        .with("values", reply.values)
        .with("result", reply.result);
    if let Some(id) = id {
        envelope.insert("id", id);
    }
    outlet.send(&envelope);
}

fn advertise_service(protocol: &Protocol, envelope: &Envelope) -> Result<(), BridgeError> {
    let service = checked_service(protocol, envelope)?;
    let srv_type = envelope.str_field("type")?;
    protocol
        .bridge()
        .services()
        .advertise(service, srv_type, protocol.id(), protocol.outlet().clone());
    Ok(())
}

fn unadvertise_service(protocol: &Protocol, envelope: &Envelope) -> Result<(), BridgeError> {
    let service = checked_service(protocol, envelope)?;
    if !protocol.bridge().services().unadvertise(service, protocol.id()) {
        debug!(client_id = protocol.id(), service, "unadvertise_service of a service not provided");
    }
    Ok(())
}

fn service_response(protocol: &Protocol, envelope: &Envelope) -> Result<(), BridgeError> {
    let call_id = envelope.str_field("id")?;
    let reply = ServiceReply {
        values: envelope.get("values").cloned().unwrap_or(WireValue::Null),
        result: envelope.opt_bool("result")?.unwrap_or(true),
    };
    protocol
        .bridge()
        .services()
        .complete(call_id, protocol.id(), reply)
}

// ---------------------------------------------------------------------------
// Fragments
// ---------------------------------------------------------------------------

fn defragment(protocol: &Protocol, envelope: &Envelope) -> Result<(), BridgeError> {
    let fragment = Fragment::from_envelope(envelope)?;
    let Some(frame) = protocol
        .bridge()
        .defragmenter()
        .accept(protocol.id(), fragment)?
    else {
        return Ok(());
    };
    let whole = protocol.bridge().codec().deserialize(&frame)?;
    debug!(client_id = protocol.id(), op = whole.op(), "dispatching reassembled message");
    protocol.dispatch(whole);
    Ok(())
}
