//! RDF graphs, media types and the message mapping.
//!
//! [`RdfGraph`] is a thin wrapper over an `oxrdf` graph with `oxrdfio`
//! parsers and serializers.  A message is a `ros:Message` node whose fields
//! are `ros:<field>` properties:
//!
//! | Value | RDF |
//! |---|---|
//! | map | blank node with `ros:<key>` properties |
//! | array | RDF list (`rdf:first` / `rdf:rest`) |
//! | bool, int, float | typed literal |
//! | string | plain literal |
//! | bytes | `xsd:hexBinary` literal |
//! | `@rostype` | `ros:Type` |

use std::collections::HashSet;

use linkbridge_middleware::negotiate::{negotiate, parse_media_type};
use linkbridge_middleware::WireFormat;
use linkbridge_notify::{Encoder, EnvelopeEncoder, Payload, Update};
use linkbridge_types::{BridgeError, WireMap, WireValue};
use oxrdf::vocab::{rdf, xsd};
use oxrdf::{BlankNode, Graph, GraphNameRef, Literal, NamedNode, Subject, Term, Triple};
use oxrdfio::{RdfFormat, RdfParser, RdfSerializer};

pub mod ns {
    pub const ROS: &str = "http://ros.org/#";
    pub const HYBRIT: &str = "https://hybr-it-projekt.de/ns/hybr-it#";
    pub const SUBSCRIPTION: &str = "https://hybr-it-projekt.de/ns/subscription#";
    pub const LDP: &str = "http://www.w3.org/ns/ldp#";
    pub const DCTERMS: &str = "http://purl.org/dc/terms/";
}

/// Message field carrying the message type.
pub const ROS_TYPE_FIELD: &str = "@rostype";

const MAX_DEPTH: usize = 64;

fn rdf_error(e: impl std::fmt::Display) -> BridgeError {
    BridgeError::Rdf(e.to_string())
}

/// `namespace` + `local` as a named node.
pub fn term(namespace: &str, local: &str) -> Result<NamedNode, BridgeError> {
    NamedNode::new(format!("{namespace}{local}")).map_err(rdf_error)
}

pub fn iri(value: &str) -> Result<NamedNode, BridgeError> {
    NamedNode::new(value).map_err(rdf_error)
}

// ---------------------------------------------------------------------------
// Media types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rendering {
    Rdf(RdfFormat),
    /// Turtle inside an escaped `<pre>` block.
    Html,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdfMediaType {
    pub mime: &'static str,
    pub rendering: Rendering,
    /// Accepted as a request body.
    pub parseable: bool,
}

/// Servable RDF media types, preferred first.  No JSON-LD serializer is
/// available, so `application/json` and `application/ld+json` are absent.
pub const RDF_MEDIA_TYPES: [RdfMediaType; 8] = [
    RdfMediaType {
        mime: "text/turtle",
        rendering: Rendering::Rdf(RdfFormat::Turtle),
        parseable: true,
    },
    RdfMediaType {
        mime: "application/rdf+xml",
        rendering: Rendering::Rdf(RdfFormat::RdfXml),
        parseable: true,
    },
    RdfMediaType {
        mime: "text/xml",
        rendering: Rendering::Rdf(RdfFormat::RdfXml),
        parseable: true,
    },
    RdfMediaType {
        mime: "text/n3",
        rendering: Rendering::Rdf(RdfFormat::N3),
        parseable: true,
    },
    RdfMediaType {
        mime: "application/n-triples",
        rendering: Rendering::Rdf(RdfFormat::NTriples),
        parseable: true,
    },
    RdfMediaType {
        mime: "application/trig",
        rendering: Rendering::Rdf(RdfFormat::TriG),
        parseable: true,
    },
    RdfMediaType {
        mime: "text/plain",
        rendering: Rendering::Rdf(RdfFormat::Turtle),
        parseable: false,
    },
    RdfMediaType {
        mime: "text/html",
        rendering: Rendering::Html,
        parseable: false,
    },
];

/// Look up a `Content-Type`/`Accept` value, ignoring parameters.
pub fn media_type(value: &str) -> Option<&'static RdfMediaType> {
    let mime = parse_media_type(value);
    RDF_MEDIA_TYPES.iter().find(|m| m.mime == mime)
}

/// The RDF format a request body of `content_type` can be parsed with.
pub fn parseable_format(content_type: &str) -> Option<RdfFormat> {
    match media_type(content_type) {
        Some(RdfMediaType {
            rendering: Rendering::Rdf(format),
            parseable: true,
            ..
        }) => Some(*format),
        _ => None,
    }
}

/// Value for the `Accept-Post` header.
pub fn accept_post() -> String {
    RDF_MEDIA_TYPES
        .iter()
        .filter(|m| m.parseable)
        .map(|m| m.mime)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Best RDF media type for `accept`; Turtle when nothing matches.
pub fn negotiate_rdf(accept: Option<&str>) -> &'static RdfMediaType {
    let mimes: Vec<&str> = RDF_MEDIA_TYPES.iter().map(|m| m.mime).collect();
    negotiate(accept, &mimes)
        .and_then(|mime| media_type(mime))
        .unwrap_or(&RDF_MEDIA_TYPES[0])
}

/// Every content type an update can be delivered in.
pub fn delivery_media_types() -> Vec<&'static str> {
    RDF_MEDIA_TYPES
        .iter()
        .map(|m| m.mime)
        .chain(WireFormat::ALL.iter().map(|f| f.mime()))
        .collect()
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RdfGraph {
    graph: Graph,
}

impl RdfGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `data`; relative IRIs resolve against `base` when given.
    pub fn parse(data: &[u8], format: RdfFormat, base: Option<&str>) -> Result<Self, BridgeError> {
        let mut parser = RdfParser::from_format(format);
        if let Some(base) = base {
            parser = parser.with_base_iri(base).map_err(rdf_error)?;
        }
        let mut graph = Graph::new();
        for quad in parser.for_reader(data) {
            let quad = quad.map_err(rdf_error)?;
            graph.insert(&Triple::new(quad.subject, quad.predicate, quad.object));
        }
        Ok(Self { graph })
    }

    pub fn add_triple(
        &mut self,
        subject: impl Into<Subject>,
        predicate: NamedNode,
        object: impl Into<Term>,
    ) -> bool {
        self.graph.insert(&Triple::new(subject, predicate, object))
    }

    /// Triples matching the pattern; `None` matches anything.
    pub fn triples_matching(
        &self,
        subject: Option<&Subject>,
        predicate: Option<&NamedNode>,
        object: Option<&Term>,
    ) -> Vec<Triple> {
        self.graph
            .iter()
            .map(|t| t.into_owned())
            .filter(|t| subject.is_none_or(|s| &t.subject == s))
            .filter(|t| predicate.is_none_or(|p| &t.predicate == p))
            .filter(|t| object.is_none_or(|o| &t.object == o))
            .collect()
    }

    /// First object of `subject predicate ?o`.
    pub fn object(&self, subject: &Subject, predicate: &NamedNode) -> Option<Term> {
        self.triples_matching(Some(subject), Some(predicate), None)
            .into_iter()
            .next()
            .map(|t| t.object)
    }

    /// Subjects typed `class`.
    pub fn instances_of(&self, class: &NamedNode) -> Vec<Subject> {
        let class = Term::from(class.clone());
        self.triples_matching(None, Some(&rdf::TYPE.into_owned()), Some(&class))
            .into_iter()
            .map(|t| t.subject)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn extend(&mut self, other: &RdfGraph) {
        for triple in other.graph.iter() {
            self.graph.insert(triple);
        }
    }

    pub fn serialize(&self, format: RdfFormat) -> Result<Vec<u8>, BridgeError> {
        let mut writer = RdfSerializer::from_format(format).for_writer(Vec::new());
        for triple in self.graph.iter() {
            writer
                .serialize_quad(triple.in_graph(GraphNameRef::DefaultGraph))
                .map_err(rdf_error)?;
        }
        writer.finish().map_err(rdf_error)
    }

    /// Serialize for `media`.
    pub fn render(&self, media: &RdfMediaType) -> Result<Vec<u8>, BridgeError> {
        match media.rendering {
            Rendering::Rdf(format) => self.serialize(format),
            Rendering::Html => {
                let turtle = self.serialize(RdfFormat::Turtle)?;
                let text = String::from_utf8_lossy(&turtle);
                let mut html = String::from("<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"></head><body><pre>");
                for c in text.chars() {
                    match c {
                        '<' => html.push_str("&lt;"),
                        '>' => html.push_str("&gt;"),
                        '&' => html.push_str("&amp;"),
                        '"' => html.push_str("&quot;"),
                        c => html.push(c),
                    }
                }
                html.push_str("</pre></body></html>\n");
                Ok(html.into_bytes())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Message mapping
// ---------------------------------------------------------------------------

/// Add `msg` as a `ros:Message` node and return the node.
pub fn add_message(graph: &mut RdfGraph, msg: &WireValue, msg_type: Option<&str>) -> Result<Subject, BridgeError> {
    let node = Subject::from(BlankNode::default());
    graph.add_triple(node.clone(), rdf::TYPE.into_owned(), term(ns::ROS, "Message")?);
    if let Some(msg_type) = msg_type {
        graph.add_triple(node.clone(), term(ns::ROS, "Type")?, Literal::new_simple_literal(msg_type));
    }
    match msg {
        WireValue::Map(fields) => add_fields(graph, &node, fields, 0)?,
        other => {
            let value = value_term(graph, other, 0)?;
            graph.add_triple(node.clone(), term(ns::ROS, "data")?, value);
        }
    }
    Ok(node)
}

fn add_fields(graph: &mut RdfGraph, node: &Subject, fields: &WireMap, depth: usize) -> Result<(), BridgeError> {
    for (key, value) in fields {
        if value.is_null() {
            continue;
        }
        let predicate = if key == ROS_TYPE_FIELD {
            term(ns::ROS, "Type")?
        } else {
            term(ns::ROS, key)?
        };
        let object = value_term(graph, value, depth + 1)?;
        graph.add_triple(node.clone(), predicate, object);
    }
    Ok(())
}

fn value_term(graph: &mut RdfGraph, value: &WireValue, depth: usize) -> Result<Term, BridgeError> {
    if depth > MAX_DEPTH {
        return Err(BridgeError::Rdf("message nested too deeply".into()));
    }
    Ok(match value {
        WireValue::Null => rdf::NIL.into_owned().into(),
        WireValue::Bool(b) => Literal::from(*b).into(),
        WireValue::Int(i) => Literal::from(*i).into(),
        WireValue::UInt(u) => Literal::new_typed_literal(u.to_string(), xsd::UNSIGNED_LONG).into(),
        WireValue::Float(x) => Literal::from(*x).into(),
        WireValue::String(s) => Literal::new_simple_literal(s.as_str()).into(),
        WireValue::Bytes(bytes) => Literal::new_typed_literal(hex::encode_upper(bytes), xsd::HEX_BINARY).into(),
        WireValue::Map(fields) => {
            let node = BlankNode::default();
            add_fields(graph, &node.clone().into(), fields, depth)?;
            node.into()
        }
        WireValue::Array(items) => {
            let mut head: Term = rdf::NIL.into_owned().into();
            for item in items.iter().rev() {
                let cell = BlankNode::default();
                let value = value_term(graph, item, depth + 1)?;
                graph.add_triple(cell.clone(), rdf::FIRST.into_owned(), value);
                graph.add_triple(cell.clone(), rdf::REST.into_owned(), head);
                head = cell.into();
            }
            head
        }
    })
}

/// Every `ros:Message` node in `graph` as `(type, message)`.  With
/// `add_ros_type` the type is also stored under [`ROS_TYPE_FIELD`].
pub fn extract_messages(graph: &RdfGraph, add_ros_type: bool) -> Result<Vec<(Option<String>, WireValue)>, BridgeError> {
    let class = term(ns::ROS, "Message")?;
    graph
        .instances_of(&class)
        .into_iter()
        .map(|node| node_value(graph, &node, add_ros_type, 0))
        .collect()
}

fn node_value(
    graph: &RdfGraph,
    node: &Subject,
    add_ros_type: bool,
    depth: usize,
) -> Result<(Option<String>, WireValue), BridgeError> {
    if depth > MAX_DEPTH {
        return Err(BridgeError::Rdf("message nested too deeply".into()));
    }
    let first = rdf::FIRST.into_owned();
    if graph.object(node, &first).is_some() {
        return Ok((None, WireValue::Array(list_items(graph, node, add_ros_type, depth)?)));
    }

    let mut msg_type = None;
    let mut fields = WireMap::new();
    for triple in graph.triples_matching(Some(node), None, None) {
        let Some(name) = triple.predicate.as_str().strip_prefix(ns::ROS) else {
            continue;
        };
        let value = term_value(graph, &triple.object, add_ros_type, depth + 1)?;
        if name == "Type" {
            msg_type = value.as_str().map(str::to_string);
            if add_ros_type {
                fields.insert(ROS_TYPE_FIELD.to_string(), value);
            }
        } else {
            fields.insert(name.to_string(), value);
        }
    }
    Ok((msg_type, WireValue::Map(fields)))
}

fn list_items(graph: &RdfGraph, head: &Subject, add_ros_type: bool, depth: usize) -> Result<Vec<WireValue>, BridgeError> {
    let first = rdf::FIRST.into_owned();
    let rest = rdf::REST.into_owned();
    let mut items = Vec::new();
    let mut seen = HashSet::new();
    let mut cell = head.clone();
    loop {
        if !seen.insert(cell.clone()) {
            return Err(BridgeError::Rdf("cyclic RDF list".into()));
        }
        let Some(item) = graph.object(&cell, &first) else {
            break;
        };
        items.push(term_value(graph, &item, add_ros_type, depth + 1)?);
        cell = match graph.object(&cell, &rest) {
            Some(Term::BlankNode(b)) => b.into(),
            Some(Term::NamedNode(n)) if n.as_ref() != rdf::NIL => n.into(),
            _ => break,
        };
    }
    Ok(items)
}

fn term_value(graph: &RdfGraph, object: &Term, add_ros_type: bool, depth: usize) -> Result<WireValue, BridgeError> {
    match object {
        Term::Literal(literal) => Ok(literal_value(literal)),
        Term::NamedNode(n) if n.as_ref() == rdf::NIL => Ok(WireValue::Array(Vec::new())),
        Term::NamedNode(n) => Ok(node_value(graph, &n.clone().into(), add_ros_type, depth)?.1),
        Term::BlankNode(b) => Ok(node_value(graph, &b.clone().into(), add_ros_type, depth)?.1),
        #[allow(unreachable_patterns)]
        _ => Err(BridgeError::Rdf("unsupported RDF term in message".into())),
    }
}

fn literal_value(literal: &Literal) -> WireValue {
    let text = literal.value();
    let datatype = literal.datatype();
    let parsed = if datatype == xsd::BOOLEAN {
        match text {
            "true" | "1" => Some(WireValue::Bool(true)),
            "false" | "0" => Some(WireValue::Bool(false)),
            _ => None,
        }
    } else if [xsd::INTEGER, xsd::LONG, xsd::INT, xsd::SHORT, xsd::BYTE].contains(&datatype) {
        text.parse::<i64>().ok().map(WireValue::Int)
    } else if [
        xsd::UNSIGNED_LONG,
        xsd::UNSIGNED_INT,
        xsd::UNSIGNED_SHORT,
        xsd::UNSIGNED_BYTE,
        xsd::NON_NEGATIVE_INTEGER,
    ]
    .contains(&datatype)
    {
        text.parse::<u64>().ok().map(WireValue::from)
    } else if [xsd::DOUBLE, xsd::FLOAT, xsd::DECIMAL].contains(&datatype) {
        text.parse::<f64>().ok().map(WireValue::Float)
    } else if datatype == xsd::HEX_BINARY {
        // Not valid hex: kept as the literal text below.
        hex::decode(text).ok().map(WireValue::Bytes)
    } else {
        None
    };
    parsed.unwrap_or_else(|| WireValue::from(text))
}

// ---------------------------------------------------------------------------
// Delivery encoding
// ---------------------------------------------------------------------------

/// Encodes updates as RDF for RDF media types and as `publish` envelopes for
/// the protocol wire formats.
#[derive(Debug, Default, Clone, Copy)]
pub struct RdfEncoder;

impl Encoder for RdfEncoder {
    fn encode(&self, update: &Update, content_type: &str) -> Result<Payload, BridgeError> {
        let Some(media) = media_type(content_type) else {
            return EnvelopeEncoder.encode(update, content_type);
        };
        let mut graph = RdfGraph::new();
        add_message(&mut graph, &update.message, None)?;
        Ok(Payload::new(media.mime, graph.render(media)?))
    }
}
