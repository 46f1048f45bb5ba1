//! `Accept`-header negotiation.
//!
//! Used twice: the WebSocket endpoints pick a [`WireFormat`] for outbound
//! envelopes, and the resource surface picks an RDF serialization.
//!
//! Matching follows the usual weighted rules: every supported type takes the
//! quality of the most specific range that matches it (`type/subtype` beats
//! `type/*` beats `*/*`), `q=0` excludes, the highest quality wins and ties go
//! to the earlier entry of the supported list.

use linkbridge_types::Envelope;

use crate::codec::WireFormat;

/// One entry of an `Accept` header.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRange {
    pub kind: String,
    pub subtype: String,
    pub q: f32,
}

impl MediaRange {
    /// 2 for an exact match, 1 for `type/*`, 0 for `*/*`, `None` otherwise.
    fn specificity(&self, kind: &str, subtype: &str) -> Option<u8> {
        if self.kind == "*" && self.subtype == "*" {
            Some(0)
        } else if self.kind == kind && self.subtype == "*" {
            Some(1)
        } else if self.kind == kind && self.subtype == subtype {
            Some(2)
        } else {
            None
        }
    }
}

/// Strip parameters and normalise case: `"Text/Turtle; charset=utf-8"` →
/// `"text/turtle"`.
pub fn parse_media_type(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Parse an `Accept` header.  Entries without a `/` are ignored; an
/// unparseable `q` counts as 1.
pub fn parse_accept(header: &str) -> Vec<MediaRange> {
    header
        .split(',')
        .filter_map(|part| {
            let mut pieces = part.split(';');
            let essence = pieces.next()?.trim().to_ascii_lowercase();
            let (kind, subtype) = essence.split_once('/')?;
            if kind.is_empty() || subtype.is_empty() {
                return None;
            }
            let q = pieces
                .filter_map(|p| p.trim().strip_prefix("q="))
                .filter_map(|v| v.trim().parse::<f32>().ok())
                .last()
                .unwrap_or(1.0)
                .clamp(0.0, 1.0);
            Some(MediaRange {
                kind: kind.to_string(),
                subtype: subtype.to_string(),
                q,
            })
        })
        .collect()
}

/// Choose the best of `supported` for `accept`.
///
/// A missing or blank header selects the first supported entry.
pub fn negotiate<'a, T: AsRef<str>>(accept: Option<&str>, supported: &'a [T]) -> Option<&'a T> {
    let header = accept.map(str::trim).unwrap_or_default();
    if header.is_empty() {
        return supported.first();
    }
    let ranges = parse_accept(header);

    let mut best: Option<(&'a T, f32)> = None;
    for candidate in supported {
        let essence = parse_media_type(candidate.as_ref());
        let Some((kind, subtype)) = essence.split_once('/') else {
            continue;
        };
        let q = ranges
            .iter()
            .filter_map(|r| r.specificity(kind, subtype).map(|s| (s, r.q)))
            .max_by_key(|(s, _)| *s)
            .map(|(_, q)| q)
            .unwrap_or(0.0);
        if q <= 0.0 {
            continue;
        }
        if best.is_none_or(|(_, best_q)| q > best_q) {
            best = Some((candidate, q));
        }
    }
    best.map(|(c, _)| c)
}

/// Outbound wire format for a connection whose upgrade request carried
/// `accept`.  Anything unrecognised falls back to JSON.
pub fn negotiate_wire_format(accept: Option<&str>) -> WireFormat {
    let supported: Vec<&str> = WireFormat::ALL.iter().map(WireFormat::mime).collect();
    negotiate(accept, &supported)
        .and_then(|mime| WireFormat::from_mime(mime))
        .unwrap_or(WireFormat::Json)
}

/// `true` when `envelope` can only travel in the binary container.
pub fn requires_binary(envelope: &Envelope) -> bool {
    envelope.contains_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkbridge_types::WireValue;

    const RDF: [&str; 3] = ["text/turtle", "application/rdf+xml", "application/n-triples"];

    #[test]
    fn quality_beats_order() {
        let got = negotiate(Some("text/turtle;q=0.5, application/rdf+xml"), &RDF);
        assert_eq!(got, Some(&"application/rdf+xml"));
    }

    #[test]
    fn ties_follow_supported_order() {
        let got = negotiate(Some("application/n-triples, text/turtle"), &RDF);
        assert_eq!(got, Some(&"text/turtle"));
    }

    #[test]
    fn specific_range_overrides_wildcard() {
        // */* would admit turtle, but the exact entry excludes it.
        let got = negotiate(Some("*/*;q=0.8, text/turtle;q=0"), &RDF);
        assert_eq!(got, Some(&"application/rdf+xml"));
    }

    #[test]
    fn subtype_wildcard() {
        let got = negotiate(Some("application/*"), &RDF);
        assert_eq!(got, Some(&"application/rdf+xml"));
    }

    #[test]
    fn nothing_acceptable() {
        assert_eq!(negotiate(Some("image/png"), &RDF), None);
    }

    #[test]
    fn missing_header_picks_first() {
        assert_eq!(negotiate(None, &RDF), Some(&"text/turtle"));
        assert_eq!(negotiate(Some("  "), &RDF), Some(&"text/turtle"));
    }

    #[test]
    fn media_type_parameters_are_dropped() {
        assert_eq!(parse_media_type("Text/Turtle; charset=UTF-8"), "text/turtle");
        assert_eq!(parse_media_type(""), "");
    }

    #[test]
    fn accept_parsing_skips_junk() {
        let ranges = parse_accept("text/html;level=1;q=0.3, garbage, */*");
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].subtype, "html");
        assert!((ranges[0].q - 0.3).abs() < f32::EPSILON);
        assert!((ranges[1].q - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn wire_format_negotiation() {
        assert_eq!(negotiate_wire_format(None), WireFormat::Json);
        assert_eq!(
            negotiate_wire_format(Some("application/msgpack")),
            WireFormat::MessagePack
        );
        assert_eq!(negotiate_wire_format(Some("text/csv")), WireFormat::Json);
    }

    #[test]
    fn binary_classification() {
        let plain = Envelope::new("publish").with("msg", "hi");
        let raw = Envelope::new("publish").with("msg", WireValue::bytes(vec![1u8]));
        assert!(!requires_binary(&plain));
        assert!(requires_binary(&raw));
    }
}
