//! Services provided by connected clients.
//!
//! A connection that sends `advertise_service` becomes the provider of that
//! service.  Calls to it are forwarded to the provider as outbound
//! `call_service` envelopes carrying a bridge-generated id, and the
//! provider's `service_response` completes the waiting caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use linkbridge_types::{BridgeError, Envelope, WireValue};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::outlet::Outlet;

/// Outcome of one service call.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceReply {
    pub values: WireValue,
    pub result: bool,
}

impl ServiceReply {
    pub fn ok(values: WireValue) -> Self {
        Self {
            values,
            result: true,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        let reason: String = reason.into();
        Self {
            values: WireValue::from(reason),
            result: false,
        }
    }
}

struct Provider {
    client: u64,
    srv_type: String,
    outlet: Outlet,
}

struct PendingCall {
    service: String,
    provider: u64,
    caller: u64,
    reply: oneshot::Sender<ServiceReply>,
}

#[derive(Default)]
struct State {
    providers: HashMap<String, Provider>,
    pending: HashMap<String, PendingCall>,
}

#[derive(Default)]
pub struct ServiceRegistry {
    state: Mutex<State>,
    next_call: AtomicU64,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `client` the provider of `service`.  Returns the previous
    /// provider's id when one was replaced.
    pub fn advertise(&self, service: &str, srv_type: &str, client: u64, outlet: Outlet) -> Option<u64> {
        let previous = self.state.lock().providers.insert(
            service.to_string(),
            Provider {
                client,
                srv_type: srv_type.to_string(),
                outlet,
            },
        );
        match &previous {
            Some(prev) if prev.client != client => {
                warn!(service, previous = prev.client, client_id = client, "service provider replaced");
            }
            _ => info!(service, srv_type, client_id = client, "service advertised"),
        }
        previous.map(|p| p.client)
    }

    /// Withdraw `service` if `client` provides it.  Calls still waiting on
    /// it fail.
    pub fn unadvertise(&self, service: &str, client: u64) -> bool {
        let mut state = self.state.lock();
        if !state.providers.get(service).is_some_and(|p| p.client == client) {
            return false;
        }
        state.providers.remove(service);
        fail_pending(&mut state, |call| call.service == service && call.provider == client);
        info!(service, client_id = client, "service unadvertised");
        true
    }

    /// Drop everything `client` provides.  Returns the withdrawn names.
    pub fn remove_client(&self, client: u64) -> Vec<String> {
        let mut state = self.state.lock();
        let names: Vec<String> = state
            .providers
            .iter()
            .filter(|(_, p)| p.client == client)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            state.providers.remove(name);
        }
        fail_pending(&mut state, |call| call.provider == client);
        names
    }

    pub fn provider(&self, service: &str) -> Option<u64> {
        self.state.lock().providers.get(service).map(|p| p.client)
    }

    pub fn service_type(&self, service: &str) -> Option<String> {
        self.state
            .lock()
            .providers
            .get(service)
            .map(|p| p.srv_type.clone())
    }

    /// Forward a call made by client `caller` to the client providing
    /// `service`.
    ///
    /// `Ok(None)` when no client provides it; the caller then falls back to
    /// the bus.
    pub fn route_call(
        &self,
        service: &str,
        caller: u64,
        args: WireValue,
    ) -> Result<Option<oneshot::Receiver<ServiceReply>>, BridgeError> {
        let mut state = self.state.lock();
        let Some(provider) = state.providers.get(service) else {
            return Ok(None);
        };
        let call_id = format!(
            "service_request:{service}:{}",
            self.next_call.fetch_add(1, Ordering::Relaxed)
        );
        let request = Envelope::new("call_service")
            .with("service", service)
            .with("args", args)
            .with("id", call_id.as_str());
        if !provider.outlet.send(&request) {
            return Err(BridgeError::ServiceFailed(format!(
                "provider of {service} is no longer reachable"
            )));
        }
        let provider = provider.client;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(
            call_id,
            PendingCall {
                service: service.to_string(),
                provider,
                caller,
                reply: tx,
            },
        );
        Ok(Some(rx))
    }

    /// Complete the pending call `call_id` with a provider's answer.
    pub fn complete(&self, call_id: &str, client: u64, reply: ServiceReply) -> Result<(), BridgeError> {
        let mut state = self.state.lock();
        match state.pending.get(call_id) {
            Some(call) if call.provider == client => {}
            _ => {
                return Err(BridgeError::InvalidField {
                    field: "id".into(),
                    reason: format!("no pending service call {call_id}"),
                });
            }
        }
        if let Some(call) = state.pending.remove(call_id) {
            // The caller may have gone away; nothing to do then.
            let _ = call.reply.send(reply);
        }
        Ok(())
    }

    /// Forget the calls `client` is still waiting on.  A late provider
    /// answer to one of them is then rejected as unknown.
    pub fn discard_caller(&self, client: u64) -> usize {
        let mut state = self.state.lock();
        let before = state.pending.len();
        state.pending.retain(|_, call| call.caller != client);
        before - state.pending.len()
    }

    pub fn pending_calls(&self) -> usize {
        self.state.lock().pending.len()
    }
}

fn fail_pending(state: &mut State, matches: impl Fn(&PendingCall) -> bool) {
    let ids: Vec<String> = state
        .pending
        .iter()
        .filter(|(_, call)| matches(call))
        .map(|(id, _)| id.clone())
        .collect();
    for id in ids {
        if let Some(call) = state.pending.remove(&id) {
            let _ = call
                .reply
                .send(ServiceReply::failed(format!("{} is no longer provided", call.service)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, WireFormat};

    fn provider_outlet(client: u64) -> (Outlet, tokio::sync::mpsc::UnboundedReceiver<crate::codec::Frame>) {
        Outlet::channel(client, Codec::default(), WireFormat::Json, None)
    }

    #[tokio::test]
    async fn call_is_forwarded_and_completed() -> Result<(), Box<dyn std::error::Error>> {
        let registry = ServiceRegistry::new();
        let (outlet, mut frames) = provider_outlet(7);
        assert_eq!(registry.advertise("/sum", "AddTwoInts", 7, outlet), None);

        let rx = registry.route_call("/sum", 9, WireValue::Int(1))?.ok_or("not routed")?;
        let request = Codec::default().deserialize(&frames.recv().await.ok_or("no request")?)?;
        assert_eq!(request.op(), "call_service");
        let call_id = request.str_field("id")?.to_string();

        registry.complete(&call_id, 7, ServiceReply::ok(WireValue::Int(3)))?;
        assert_eq!(rx.await?, ServiceReply::ok(WireValue::Int(3)));
        assert_eq!(registry.pending_calls(), 0);
        Ok(())
    }

    #[test]
    fn unknown_service_is_not_routed() -> Result<(), Box<dyn std::error::Error>> {
        let registry = ServiceRegistry::new();
        assert!(registry.route_call("/nope", 9, WireValue::Null)?.is_none());
        Ok(())
    }

    #[test]
    fn completing_unknown_or_foreign_call_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let registry = ServiceRegistry::new();
        let (outlet, _frames) = provider_outlet(1);
        registry.advertise("/s", "T", 1, outlet);
        let _rx = registry.route_call("/s", 9, WireValue::Null)?;
        assert!(registry.complete("bogus", 1, ServiceReply::ok(WireValue::Null)).is_err());
        assert!(
            registry
                .complete("service_request:/s:0", 2, ServiceReply::ok(WireValue::Null))
                .is_err()
        );
        Ok(())
    }

    #[tokio::test]
    async fn provider_disconnect_fails_pending_calls() -> Result<(), Box<dyn std::error::Error>> {
        let registry = ServiceRegistry::new();
        let (outlet, _frames) = provider_outlet(3);
        registry.advertise("/s", "T", 3, outlet);
        let rx = registry.route_call("/s", 9, WireValue::Null)?.ok_or("not routed")?;

        assert_eq!(registry.remove_client(3), vec!["/s".to_string()]);
        let reply = rx.await?;
        assert!(!reply.result);
        assert_eq!(registry.provider("/s"), None);
        Ok(())
    }

    #[test]
    fn only_the_provider_may_unadvertise() {
        let registry = ServiceRegistry::new();
        let (a, _fa) = provider_outlet(1);
        let (b, _fb) = provider_outlet(2);
        registry.advertise("/s", "T", 1, a);
        assert_eq!(registry.advertise("/s", "T", 2, b), Some(1));
        assert!(!registry.unadvertise("/s", 1));
        assert!(registry.unadvertise("/s", 2));
        assert!(!registry.unadvertise("/s", 2));
    }

    #[tokio::test]
    async fn departed_callers_leave_no_pending_calls() -> Result<(), Box<dyn std::error::Error>> {
        let registry = ServiceRegistry::new();
        let (outlet, _frames) = provider_outlet(1);
        registry.advertise("/slow", "T", 1, outlet);
        let abandoned = registry.route_call("/slow", 5, WireValue::Null)?.ok_or("not routed")?;
        let _kept = registry.route_call("/slow", 6, WireValue::Null)?.ok_or("not routed")?;
        assert_eq!(registry.pending_calls(), 2);

        assert_eq!(registry.discard_caller(5), 1);
        assert_eq!(registry.pending_calls(), 1);
        assert!(abandoned.await.is_err());
        assert!(
            registry
                .complete("service_request:/slow:0", 1, ServiceReply::ok(WireValue::Null))
                .is_err()
        );
        assert_eq!(registry.discard_caller(5), 0);
        Ok(())
    }
}
