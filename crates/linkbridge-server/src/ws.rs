//! WebSocket acceptor.
//!
//! | Path | Connection |
//! |---|---|
//! | `/` | envelope protocol |
//! | `/lrtws/topics/<name>` | envelope protocol plus a push-socket target for `/<name>` |
//!
//! Each connection runs on its own task: inbound frames are dispatched in
//! arrival order on that task while a writer task drains the outbound
//! channels.  Whatever ends the connection, the protocol is destroyed.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use linkbridge_middleware::Frame;
use linkbridge_middleware::negotiate::{negotiate, negotiate_wire_format};
use linkbridge_types::BridgeError;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

use crate::BridgeHub;
use crate::rdf::delivery_media_types;

/// Prefix of push-socket paths.
pub const PUSH_PREFIX: &str = "/lrtws/topics/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Protocol,
    Push { topic: String },
}

impl Route {
    pub fn parse(path: &str) -> Option<Route> {
        if path.is_empty() || path == "/" {
            return Some(Route::Protocol);
        }
        let name = path.strip_prefix(PUSH_PREFIX)?.trim_matches('/');
        if name.is_empty() {
            return None;
        }
        Some(Route::Push {
            topic: format!("/{name}"),
        })
    }
}

/// What the upgrade request asked for.
#[derive(Debug, Default)]
struct Upgrade {
    route: Option<Route>,
    accept: Option<String>,
}

pub struct WsServer {
    hub: Arc<BridgeHub>,
}

impl WsServer {
    pub fn new(hub: Arc<BridgeHub>) -> Self {
        Self { hub }
    }

    pub async fn bind(&self) -> Result<TcpListener, BridgeError> {
        let settings = self.hub.settings();
        let addr = format!("{}:{}", settings.address, settings.port);
        TcpListener::bind(&addr)
            .await
            .map_err(|e| BridgeError::Channel(format!("websocket bind on {addr}: {e}")))
    }

    /// Accept connections on `listener` forever.
    pub async fn serve(self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "websocket server listening");
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let hub = Arc::clone(&self.hub);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(hub, stream, peer).await {
                            warn!(peer = %peer, error = %e, "websocket connection failed");
                        }
                    });
                }
                Err(e) => error!(error = %e, "websocket accept error"),
            }
        }
    }
}

async fn handle_connection(hub: Arc<BridgeHub>, stream: TcpStream, peer: SocketAddr) -> Result<(), BridgeError> {
    let mut upgrade = Upgrade::default();
    let bridge = Arc::clone(hub.bridge());
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let route = Route::parse(request.uri().path());
        let refused = match &route {
            Some(Route::Protocol) => None,
            Some(Route::Push { topic }) if !bridge.settings().topics.allows(topic) => Some(StatusCode::FORBIDDEN),
            Some(Route::Push { topic }) if bridge.bus().topic_type(topic).is_none() => Some(StatusCode::NOT_FOUND),
            Some(Route::Push { .. }) => None,
            None => Some(StatusCode::NOT_FOUND),
        };
        if let Some(status) = refused {
            let mut refusal = ErrorResponse::new(Some(format!("refused endpoint: {}", request.uri().path())));
            *refusal.status_mut() = status;
            return Err(refusal);
        }
        upgrade.route = route;
        upgrade.accept = request
            .headers()
            .get("accept")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(response)
    };
    let ws = accept_hdr_async(stream, callback)
        .await
        .map_err(|e| BridgeError::Channel(format!("websocket handshake from {peer}: {e}")))?;
    let Some(route) = upgrade.route else {
        return Err(BridgeError::Channel(format!("handshake from {peer} carried no route")));
    };

    let format = negotiate_wire_format(upgrade.accept.as_deref());
    let (protocol, mut outbound) = hub.bridge().connect(format);
    let client_id = protocol.id();
    let (push_tx, mut pushed) = mpsc::unbounded_channel::<Frame>();

    if let Route::Push { topic } = &route {
        let supported = delivery_media_types();
        let content_type = negotiate(upgrade.accept.as_deref(), &supported)
            .copied()
            .unwrap_or("text/turtle");
        hub.subscribe_push(topic, client_id, push_tx.clone(), content_type)?;
        info!(client_id, peer = %peer, topic = %topic, content_type, "push socket connected");
    } else {
        info!(client_id, peer = %peer, "client connected");
    }
    drop(push_tx);

    let (mut ws_tx, mut ws_rx) = ws.split();
    let delay = hub.settings().delay_between_messages;
    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                Some(frame) = outbound.recv() => frame,
                Some(frame) = pushed.recv() => frame,
                else => break,
            };
            let message = match frame {
                Frame::Text(text) => Message::Text(text.into()),
                Frame::Binary(bytes) => Message::Binary(bytes.into()),
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        let _ = ws_tx.close().await;
    });

    let idle = hub.settings().idle_timeout;
    loop {
        let next = match idle {
            Some(limit) => match tokio::time::timeout(limit, ws_rx.next()).await {
                Ok(next) => next,
                Err(_) => {
                    info!(client_id, idle_secs = limit.as_secs_f64(), "closing idle connection");
                    break;
                }
            },
            None => ws_rx.next().await,
        };
        match next {
            Some(Ok(Message::Text(text))) => protocol.incoming(Frame::Text(text.to_string())),
            Some(Ok(Message::Binary(bytes))) => protocol.incoming(Frame::Binary(bytes.to_vec())),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!(client_id, error = %e, "websocket read error");
                break;
            }
            Some(Ok(_)) => {}
        }
    }

    protocol.destroy();
    writer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServerSettings;
    use linkbridge_middleware::{AtomicCounter, Bridge, Bus, LocalBus, NameFilter, ProtocolSettings};
    use linkbridge_notify::EngineConfig;
    use linkbridge_types::WireValue;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    async fn start(bus: Arc<LocalBus>) -> Result<(Arc<BridgeHub>, SocketAddr), Box<dyn std::error::Error>> {
        start_with(bus, ProtocolSettings::default()).await
    }

    async fn start_with(
        bus: Arc<LocalBus>,
        settings: ProtocolSettings,
    ) -> Result<(Arc<BridgeHub>, SocketAddr), Box<dyn std::error::Error>> {
        let bridge = Bridge::new(bus, Arc::new(AtomicCounter::new()), settings);
        let hub = BridgeHub::new(bridge, EngineConfig::default(), ServerSettings::default());
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(WsServer::new(Arc::clone(&hub)).serve(listener));
        Ok((hub, addr))
    }

    async fn next_text<S>(ws: &mut S) -> Result<String, Box<dyn std::error::Error>>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), ws.next()).await? {
                Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
                Some(Ok(_)) => continue,
                other => return Err(format!("unexpected {other:?}").into()),
            }
        }
    }

    #[test]
    fn routes() {
        assert_eq!(Route::parse("/"), Some(Route::Protocol));
        assert_eq!(
            Route::parse("/lrtws/topics/scan"),
            Some(Route::Push { topic: "/scan".into() })
        );
        assert_eq!(
            Route::parse("/lrtws/topics/robot/odom/"),
            Some(Route::Push {
                topic: "/robot/odom".into()
            })
        );
        assert_eq!(Route::parse("/lrtws/topics/"), None);
        assert_eq!(Route::parse("/elsewhere"), None);
    }

    #[tokio::test]
    async fn protocol_clients_exchange_messages() -> Result<(), Box<dyn std::error::Error>> {
        let (_hub, addr) = start(Arc::new(LocalBus::new())).await?;
        let (mut publisher, _) = connect_async(format!("ws://{addr}/")).await?;
        let (mut subscriber, _) = connect_async(format!("ws://{addr}/")).await?;

        publisher
            .send(Message::Text(
                r#"{"op":"advertise","topic":"/chatter","type":"std_msgs/String"}"#.into(),
            ))
            .await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        subscriber
            .send(Message::Text(r#"{"op":"subscribe","topic":"/chatter"}"#.into()))
            .await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        publisher
            .send(Message::Text(
                r#"{"op":"publish","topic":"/chatter","msg":{"data":"hi"}}"#.into(),
            ))
            .await?;

        let text = next_text(&mut subscriber).await?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        assert_eq!(value["op"], "publish");
        assert_eq!(value["msg"]["data"], "hi");
        Ok(())
    }

    #[tokio::test]
    async fn push_socket_receives_negotiated_updates() -> Result<(), Box<dyn std::error::Error>> {
        let bus = Arc::new(LocalBus::new());
        bus.register_publisher("/scan", "sensor_msgs/LaserScan", false, 10)?;
        let (hub, addr) = start(bus.clone()).await?;

        let mut request = format!("ws://{addr}/lrtws/topics/scan").into_client_request()?;
        request
            .headers_mut()
            .insert("accept", HeaderValue::from_static("application/json"));
        let (mut socket, _) = connect_async(request).await?;

        for _ in 0..100 {
            if !hub.engine().targets().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let targets = hub.engine().targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].content_type(), "application/json");

        bus.publish("/scan", WireValue::from("sweep"))?;
        hub.engine().run_once().await;
        let text = next_text(&mut socket).await?;
        assert!(text.contains("sweep"));

        socket.close(None).await?;
        for _ in 0..100 {
            if hub.engine().targets().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(hub.engine().targets().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_paths_are_refused() -> Result<(), Box<dyn std::error::Error>> {
        let (_hub, addr) = start(Arc::new(LocalBus::new())).await?;
        assert!(connect_async(format!("ws://{addr}/lrtws/topics/missing")).await.is_err());
        assert!(connect_async(format!("ws://{addr}/other")).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn push_sockets_honour_topic_globs() -> Result<(), Box<dyn std::error::Error>> {
        let bus = Arc::new(LocalBus::new());
        bus.register_publisher("/private", "std_msgs/String", false, 10)?;
        let settings = ProtocolSettings {
            topics: NameFilter::new(["/public/*"])?,
            ..ProtocolSettings::default()
        };
        let (hub, addr) = start_with(bus.clone(), settings).await?;

        match connect_async(format!("ws://{addr}/lrtws/topics/private")).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::FORBIDDEN);
            }
            other => return Err(format!("handshake was not refused: {:?}", other.map(|_| ())).into()),
        }
        assert!(hub.engine().targets().is_empty());
        assert_eq!(bus.subscriber_count("/private"), 0);
        Ok(())
    }
}
