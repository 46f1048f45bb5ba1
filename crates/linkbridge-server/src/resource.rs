//! Resource-oriented HTTP surface.
//!
//! | Route | Methods |
//! |---|---|
//! | `/lrt/` | `GET` root description |
//! | `/lrt/topics/` | `GET` container, `POST` create a topic |
//! | `/lrt/topics/{name}/` | `GET` describe, `POST` publish RDF messages, `DELETE` unadvertise |
//! | `/lrt/topics/{name}/subscriptions/` | `GET` container, `POST` subscribe |
//! | `/lrt/topics/{name}/subscriptions/{id}` | `GET` describe, `DELETE` unsubscribe |
//!
//! Bodies are RDF; responses are negotiated from `Accept`.

use std::collections::HashSet;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::{ACCEPT, CONTENT_TYPE, HOST, LOCATION};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use linkbridge_middleware::EntryKey;
use linkbridge_middleware::publishers::DEFAULT_QUEUE_SIZE;
use linkbridge_notify::{DeliveryTarget, TargetKind};
use linkbridge_types::BridgeError;
use oxrdf::vocab::{rdf, xsd};
use oxrdf::{Literal, NamedNode, Subject, Term};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::BridgeHub;
use crate::rdf::{
    RdfGraph, accept_post, delivery_media_types, extract_messages, iri, negotiate_rdf, ns,
    parseable_format, term,
};
use crate::ws::PUSH_PREFIX;

const ACCEPT_POST: HeaderName = HeaderName::from_static("accept-post");
const SURFACE_ENTRY_ID: &str = "lrt";
const DEFAULT_MEDIA_TYPE: &str = "text/turtle";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    reason: String,
    accept_post: bool,
}

impl ApiError {
    fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            accept_post: false,
        }
    }

    fn not_found(what: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, what)
    }

    fn unsupported_media_type(content_type: &str) -> Self {
        Self {
            accept_post: true,
            ..Self::new(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                format!("cannot parse {content_type}"),
            )
        }
    }
}

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        let status = match &e {
            BridgeError::TopicNotEstablished(_) | BridgeError::UnknownService(_) => StatusCode::NOT_FOUND,
            BridgeError::NotAllowed(_) => StatusCode::FORBIDDEN,
            BridgeError::TypeConflict { .. } => StatusCode::CONFLICT,
            BridgeError::Rdf(_)
            | BridgeError::Malformed(_)
            | BridgeError::MissingField(_)
            | BridgeError::InvalidField { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = self.status.as_u16(), reason = %self.reason, "resource request failed");
        }
        let mut response = (self.status, self.reason).into_response();
        if self.accept_post
            && let Ok(value) = HeaderValue::from_str(&accept_post())
        {
            response.headers_mut().insert(ACCEPT_POST, value);
        }
        response
    }
}

type ApiResult = Result<Response, ApiError>;

// ---------------------------------------------------------------------------
// Surface state
// ---------------------------------------------------------------------------

/// The HTTP surface acts as one client of the bridge; topics it advertised
/// are tracked so `DELETE` can withdraw exactly those.
pub struct ResourceSurface {
    hub: Arc<BridgeHub>,
    client: u64,
    advertised: Mutex<HashSet<String>>,
}

impl ResourceSurface {
    pub fn new(hub: Arc<BridgeHub>) -> Arc<Self> {
        let client = hub.bridge().ids().next_id();
        Arc::new(Self {
            hub,
            client,
            advertised: Mutex::new(HashSet::new()),
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/lrt", get(root))
            .route("/lrt/", get(root))
            .route("/lrt/topics/", get(list_topics).post(create_topic))
            .route(
                "/lrt/topics/*path",
                get(get_path).post(post_path).delete(delete_path),
            )
            .with_state(Arc::clone(self))
    }

    pub async fn bind(&self) -> Result<tokio::net::TcpListener, BridgeError> {
        let settings = self.hub.settings();
        let addr = format!("{}:{}", settings.address, settings.resource_port);
        tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| BridgeError::Channel(format!("resource bind on {addr}: {e}")))
    }

    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener) -> Result<(), BridgeError> {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "resource surface listening");
        }
        axum::serve(listener, self.router())
            .await
            .map_err(|e| BridgeError::Channel(format!("resource surface: {e}")))
    }

    fn topic_type(&self, topic: &str) -> Option<String> {
        if !self.hub.bridge().settings().topics.allows(topic) {
            return None;
        }
        self.hub.bridge().bus().topic_type(topic)
    }

    fn advertise(&self, topic: &str, msg_type: Option<&str>) -> Result<(), BridgeError> {
        self.hub.bridge().settings().topics.check(topic)?;
        self.hub.bridge().publishers().advertise(
            topic,
            msg_type,
            EntryKey::new(self.client, SURFACE_ENTRY_ID),
            false,
            DEFAULT_QUEUE_SIZE,
        )?;
        self.advertised.lock().insert(topic.to_string());
        Ok(())
    }

    fn unadvertise(&self, topic: &str) -> bool {
        if !self.advertised.lock().remove(topic) {
            return false;
        }
        self.hub
            .bridge()
            .publishers()
            .unadvertise(topic, &EntryKey::new(self.client, SURFACE_ENTRY_ID))
    }
}

// ---------------------------------------------------------------------------
// Paths and URLs
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum TopicPath {
    Topic(String),
    Subscriptions(String),
    Subscription(String, String),
}

impl TopicPath {
    fn parse(rest: &str) -> TopicPath {
        let trimmed = rest.trim_end_matches('/');
        if let Some(topic) = trimmed.strip_suffix("/subscriptions") {
            return TopicPath::Subscriptions(topic_name(topic));
        }
        if let Some((topic, id)) = trimmed.rsplit_once("/subscriptions/") {
            return TopicPath::Subscription(topic_name(topic), id.to_string());
        }
        TopicPath::Topic(topic_name(trimmed))
    }
}

fn topic_name(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}

/// Absolute URL prefix of this server, from the `Host` header.
fn origin(headers: &HeaderMap) -> String {
    let host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}")
}

fn topics_url(origin: &str) -> String {
    format!("{origin}/lrt/topics/")
}

fn topic_url(origin: &str, topic: &str) -> String {
    format!("{origin}/lrt/topics/{}/", topic.trim_matches('/'))
}

fn subscriptions_url(origin: &str, topic: &str) -> String {
    format!("{}subscriptions/", topic_url(origin, topic))
}

fn subscription_url(origin: &str, topic: &str, id: &str) -> String {
    format!("{}{id}", subscriptions_url(origin, topic))
}

fn push_url(headers: &HeaderMap, port: u16, topic: &str) -> String {
    let host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    let hostname = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    format!("ws://{hostname}:{port}{PUSH_PREFIX}{}", topic.trim_matches('/'))
}

// ---------------------------------------------------------------------------
// Request and response bodies
// ---------------------------------------------------------------------------

fn graph_response(status: StatusCode, graph: &RdfGraph, headers: &HeaderMap) -> ApiResult {
    let accept = headers.get(ACCEPT).and_then(|v| v.to_str().ok());
    let media = negotiate_rdf(accept);
    let body = graph.render(media)?;
    Ok((status, [(CONTENT_TYPE, media.mime)], body).into_response())
}

fn parse_body(headers: &HeaderMap, body: &[u8], base: &str) -> Result<RdfGraph, ApiError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Some(format) = parseable_format(content_type) else {
        return Err(ApiError::unsupported_media_type(content_type));
    };
    RdfGraph::parse(body, format, Some(base)).map_err(|e| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("cannot parse {content_type} body: {e}"),
        )
    })
}

fn literal_of(graph: &RdfGraph, subject: &Subject, predicate: &NamedNode) -> Option<String> {
    match graph.object(subject, predicate)? {
        Term::Literal(l) => Some(l.value().to_string()),
        Term::NamedNode(n) => Some(n.as_str().to_string()),
        _ => None,
    }
}

fn describe_topic(graph: &mut RdfGraph, origin: &str, topic: &str, msg_type: &str) -> Result<NamedNode, BridgeError> {
    let node = iri(&topic_url(origin, topic))?;
    graph.add_triple(node.clone(), rdf::TYPE.into_owned(), term(ns::ROS, "Topic")?);
    graph.add_triple(node.clone(), term(ns::ROS, "name")?, Literal::new_simple_literal(topic));
    graph.add_triple(node.clone(), term(ns::ROS, "type")?, Literal::new_simple_literal(msg_type));
    graph.add_triple(
        node.clone(),
        term(ns::HYBRIT, "subscriptions")?,
        iri(&subscriptions_url(origin, topic))?,
    );
    Ok(node)
}

fn container(graph: &mut RdfGraph, url: &str, title: &str) -> Result<NamedNode, BridgeError> {
    let node = iri(url)?;
    graph.add_triple(node.clone(), rdf::TYPE.into_owned(), term(ns::LDP, "BasicContainer")?);
    graph.add_triple(node.clone(), rdf::TYPE.into_owned(), term(ns::LDP, "Container")?);
    graph.add_triple(node.clone(), term(ns::DCTERMS, "title")?, Literal::new_simple_literal(title));
    Ok(node)
}

fn describe_subscription(graph: &mut RdfGraph, origin: &str, target: &DeliveryTarget) -> Result<NamedNode, BridgeError> {
    let node = iri(&subscription_url(origin, target.topic(), target.id()))?;
    let topic = iri(&topic_url(origin, target.topic()))?;
    let (class, kind) = match target.kind() {
        TargetKind::Webhook { .. } => ("WebCallback", "webhook"),
        TargetKind::PushSocket { .. } => ("WebsocketCallback", "websocket"),
    };
    graph.add_triple(node.clone(), rdf::TYPE.into_owned(), term(ns::HYBRIT, "Subscription")?);
    graph.add_triple(node.clone(), rdf::TYPE.into_owned(), term(ns::HYBRIT, class)?);
    graph.add_triple(node.clone(), term(ns::SUBSCRIPTION, "type")?, Literal::new_simple_literal(kind));
    graph.add_triple(node.clone(), term(ns::HYBRIT, "onResource")?, topic.clone());
    graph.add_triple(node.clone(), term(ns::SUBSCRIPTION, "targetResource")?, topic);
    graph.add_triple(
        node.clone(),
        term(ns::HYBRIT, "mediaType")?,
        Literal::new_simple_literal(target.content_type()),
    );
    if let Some(url) = target.callback_url() {
        graph.add_triple(
            node.clone(),
            term(ns::HYBRIT, "callbackUrl")?,
            Literal::new_typed_literal(url, xsd::ANY_URI),
        );
    }
    graph.add_triple(
        node.clone(),
        term(ns::DCTERMS, "identifier")?,
        Literal::new_simple_literal(target.id()),
    );
    graph.add_triple(
        node.clone(),
        term(ns::DCTERMS, "created")?,
        Literal::new_typed_literal(target.created_at().to_rfc3339(), xsd::DATE_TIME),
    );
    Ok(node)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn root(headers: HeaderMap) -> ApiResult {
    let origin = origin(&headers);
    let mut graph = RdfGraph::new();
    let thing = iri(&format!("{origin}/lrt/"))?;
    let topics = container(&mut graph, &topics_url(&origin), "a list of all topics")?;
    graph.add_triple(thing.clone(), rdf::TYPE.into_owned(), term(ns::HYBRIT, "RoboticThing")?);
    graph.add_triple(thing, term(ns::HYBRIT, "topics")?, topics);
    graph_response(StatusCode::OK, &graph, &headers)
}

async fn list_topics(State(surface): State<Arc<ResourceSurface>>, headers: HeaderMap) -> ApiResult {
    let origin = origin(&headers);
    let mut graph = RdfGraph::new();
    let this = container(&mut graph, &topics_url(&origin), "a list of all topics")?;
    let contains = term(ns::LDP, "contains")?;
    let mut topics = surface.hub.bridge().bus().topics();
    topics.sort();
    for topic in topics {
        if let Some(msg_type) = surface.topic_type(&topic) {
            let node = describe_topic(&mut graph, &origin, &topic, &msg_type)?;
            graph.add_triple(this.clone(), contains.clone(), node);
        }
    }
    graph_response(StatusCode::OK, &graph, &headers)
}

/// `POST /lrt/topics/`: advertise every `ros:Topic` in the body.
async fn create_topic(
    State(surface): State<Arc<ResourceSurface>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let origin = origin(&headers);
    let graph = parse_body(&headers, &body, &topics_url(&origin))?;
    let topic_nodes = graph.instances_of(&term(ns::ROS, "Topic")?);
    let Some(node) = topic_nodes.first() else {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "body describes no ros:Topic"));
    };
    let name = literal_of(&graph, node, &term(ns::ROS, "name")?)
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "ros:Topic without ros:name"))?;
    let msg_type = literal_of(&graph, node, &term(ns::ROS, "type")?)
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "ros:Topic without ros:type"))?;
    let topic = topic_name(&name);

    surface.advertise(&topic, Some(&msg_type))?;
    info!(topic = %topic, msg_type = %msg_type, "topic created through resource surface");

    let location = topic_url(&origin, &topic);
    let mut described = RdfGraph::new();
    describe_topic(&mut described, &origin, &topic, &msg_type)?;
    let mut response = graph_response(StatusCode::CREATED, &described, &headers)?;
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(LOCATION, value);
    }
    Ok(response)
}

async fn get_path(
    State(surface): State<Arc<ResourceSurface>>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    let origin = origin(&headers);
    match TopicPath::parse(&path) {
        TopicPath::Topic(topic) => {
            let msg_type = surface
                .topic_type(&topic)
                .ok_or_else(|| ApiError::not_found(format!("no such topic: {topic}")))?;
            let mut graph = RdfGraph::new();
            describe_topic(&mut graph, &origin, &topic, &msg_type)?;
            graph_response(StatusCode::OK, &graph, &headers)
        }
        TopicPath::Subscriptions(topic) => {
            if surface.topic_type(&topic).is_none() {
                return Err(ApiError::not_found(format!("no such topic: {topic}")));
            }
            let mut graph = RdfGraph::new();
            let this = container(
                &mut graph,
                &subscriptions_url(&origin, &topic),
                &format!("a list of subscriptions to topic {topic}"),
            )?;
            let predicate = term(ns::HYBRIT, "subscription")?;
            for target in surface.hub.engine().targets_for(&topic) {
                let node = describe_subscription(&mut graph, &origin, &target)?;
                graph.add_triple(this.clone(), predicate.clone(), node);
            }
            graph_response(StatusCode::OK, &graph, &headers)
        }
        TopicPath::Subscription(topic, id) => {
            let target = surface
                .hub
                .engine()
                .get(&id)
                .filter(|t| t.topic() == topic)
                .ok_or_else(|| ApiError::not_found(format!("no such subscription: {id}")))?;
            let mut graph = RdfGraph::new();
            describe_subscription(&mut graph, &origin, &target)?;
            graph_response(StatusCode::OK, &graph, &headers)
        }
    }
}

async fn post_path(
    State(surface): State<Arc<ResourceSurface>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    match TopicPath::parse(&path) {
        TopicPath::Topic(topic) => publish_messages(&surface, &topic, &headers, &body),
        TopicPath::Subscriptions(topic) => subscribe(&surface, &topic, &headers, &body),
        TopicPath::Subscription(..) => Err(ApiError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "subscriptions cannot be posted to",
        )),
    }
}

/// `POST /lrt/topics/{name}/`: publish every `ros:Message` in the body.
fn publish_messages(surface: &ResourceSurface, topic: &str, headers: &HeaderMap, body: &[u8]) -> ApiResult {
    if surface.topic_type(topic).is_none() {
        return Err(ApiError::not_found(format!("no such topic: {topic}")));
    }
    let origin = origin(headers);
    let graph = parse_body(headers, body, &topic_url(&origin, topic))?;
    let messages = extract_messages(&graph, true)?;

    surface.advertise(topic, None)?;
    let publishers = surface.hub.bridge().publishers();
    for (_, msg) in &messages {
        publishers.publish(topic, surface.client, false, msg.clone())?;
    }
    info!(topic, messages = messages.len(), "published through resource surface");

    let mut response = StatusCode::NO_CONTENT.into_response();
    if let Ok(value) = HeaderValue::from_str(&accept_post()) {
        response.headers_mut().insert(ACCEPT_POST, value);
    }
    Ok(response)
}

/// `POST /lrt/topics/{name}/subscriptions/`.
fn subscribe(surface: &ResourceSurface, topic: &str, headers: &HeaderMap, body: &[u8]) -> ApiResult {
    if surface.topic_type(topic).is_none() {
        return Err(ApiError::not_found(format!("no such topic: {topic}")));
    }
    let origin = origin(headers);
    let graph = parse_body(headers, body, &subscriptions_url(&origin, topic))?;

    let kind_predicate = term(ns::SUBSCRIPTION, "type")?;
    let Some(request) = graph.triples_matching(None, Some(&kind_predicate), None).into_iter().next() else {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "body has no subscription:type"));
    };
    let node = request.subject;
    let kind = match &request.object {
        Term::Literal(l) => l.value().to_string(),
        _ => String::new(),
    };
    let media_type = literal_of(&graph, &node, &term(ns::HYBRIT, "mediaType")?)
        .unwrap_or_else(|| DEFAULT_MEDIA_TYPE.to_string());
    if !delivery_media_types().contains(&media_type.as_str()) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("cannot deliver updates as {media_type}"),
        ));
    }

    match kind.as_str() {
        "webhook" => {
            let callback_url = literal_of(&graph, &node, &term(ns::HYBRIT, "callbackUrl")?)
                .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "webhook without hybrit:callbackUrl"))?;
            let target = surface.hub.subscribe_webhook(topic, &callback_url, &media_type)?;
            let location = subscription_url(&origin, topic, target.id());
            let mut described = RdfGraph::new();
            describe_subscription(&mut described, &origin, &target)?;
            let mut response = graph_response(StatusCode::CREATED, &described, headers)?;
            if let Ok(value) = HeaderValue::from_str(&location) {
                response.headers_mut().insert(LOCATION, value);
            }
            Ok(response)
        }
        "websocket" => {
            // A push socket lives as long as its connection; the location is
            // the endpoint that opens one.
            let url = push_url(headers, surface.hub.settings().port, topic);
            let mut described = RdfGraph::new();
            let node = iri(&subscriptions_url(&origin, topic))?;
            described.add_triple(
                node,
                term(ns::HYBRIT, "websocketUrl")?,
                Literal::new_typed_literal(url.as_str(), xsd::ANY_URI),
            );
            let mut response = graph_response(StatusCode::CREATED, &described, headers)?;
            if let Ok(value) = HeaderValue::from_str(&url) {
                response.headers_mut().insert(LOCATION, value);
            }
            Ok(response)
        }
        other => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("unknown subscription type {other:?}"),
        )),
    }
}

async fn delete_path(State(surface): State<Arc<ResourceSurface>>, Path(path): Path<String>) -> ApiResult {
    match TopicPath::parse(&path) {
        TopicPath::Topic(topic) => {
            if surface.unadvertise(&topic) {
                info!(topic = %topic, "topic removed through resource surface");
                Ok(StatusCode::NO_CONTENT.into_response())
            } else {
                Err(ApiError::not_found(format!("topic {topic} was not created here")))
            }
        }
        TopicPath::Subscription(topic, id) => {
            let owned = surface.hub.engine().get(&id).is_some_and(|t| t.topic() == topic);
            if owned && surface.hub.engine().unregister(&id) {
                Ok(StatusCode::NO_CONTENT.into_response())
            } else {
                Err(ApiError::not_found(format!("no such subscription: {id}")))
            }
        }
        TopicPath::Subscriptions(_) => Err(ApiError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "subscription containers cannot be deleted",
        )),
    }
}
