//! Outbound half of a connection.
//!
//! An [`Outlet`] turns envelopes into frames (choosing the wire format,
//! fragmenting oversized frames) and queues them on the connection's writer
//! channel.  It is cheap to clone, so subscriber sinks and service tasks each
//! hold their own copy.

use linkbridge_types::Envelope;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::codec::{Codec, Frame, WireFormat};
use crate::fragment::fragment;

#[derive(Clone)]
pub struct Outlet {
    client_id: u64,
    tx: mpsc::UnboundedSender<Frame>,
    codec: Codec,
    format: WireFormat,
    fragment_size: Option<usize>,
}

impl Outlet {
    pub fn new(
        client_id: u64,
        tx: mpsc::UnboundedSender<Frame>,
        codec: Codec,
        format: WireFormat,
        fragment_size: Option<usize>,
    ) -> Self {
        Self {
            client_id,
            tx,
            codec,
            format,
            fragment_size,
        }
    }

    /// Outlet plus the receiving end the transport drains.
    pub fn channel(
        client_id: u64,
        codec: Codec,
        format: WireFormat,
        fragment_size: Option<usize>,
    ) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(client_id, tx, codec, format, fragment_size), rx)
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Send with the connection defaults.
    pub fn send(&self, envelope: &Envelope) -> bool {
        self.send_with(envelope, self.fragment_size, false)
    }

    /// Send with an entry-local fragment size and optional forced binary
    /// container.  Returns `false` when nothing was queued.
    pub fn send_with(&self, envelope: &Envelope, fragment_size: Option<usize>, force_binary: bool) -> bool {
        let preferred = if force_binary {
            WireFormat::MessagePack
        } else {
            self.format
        };
        let Some(frame) = self.codec.serialize(envelope, preferred) else {
            return false;
        };

        let size = fragment_size.or(self.fragment_size).filter(|s| *s > 0);
        let frames = match size {
            Some(size) if frame.len() > size => {
                let frag_id = match envelope.id() {
                    Some(id) => id.to_string(),
                    None => Uuid::new_v4().to_string(),
                };
                let parts = fragment(&frame, &frag_id, size);
                trace!(
                    client_id = self.client_id,
                    fragment_id = %frag_id,
                    parts = parts.len(),
                    "fragmenting outgoing message"
                );
                let part_format = self.codec.frame_format(&frame);
                let mut out = Vec::with_capacity(parts.len());
                for part in parts {
                    match self.codec.serialize(&part.to_envelope(), part_format) {
                        Some(f) => out.push(f),
                        None => return false,
                    }
                }
                out
            }
            _ => vec![frame],
        };

        for frame in frames {
            if self.tx.send(frame).is_err() {
                debug!(client_id = self.client_id, op = envelope.op(), "connection closed; dropping message");
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{Defragmenter, Fragment};
    use linkbridge_types::WireValue;

    #[tokio::test]
    async fn small_messages_go_out_whole() -> Result<(), Box<dyn std::error::Error>> {
        let (outlet, mut rx) = Outlet::channel(1, Codec::default(), WireFormat::Json, None);
        assert!(outlet.send(&Envelope::new("status").with("msg", "ok")));
        let frame = rx.recv().await.ok_or("no frame")?;
        assert!(matches!(frame, Frame::Text(t) if t.contains("\"ok\"")));
        Ok(())
    }

    #[tokio::test]
    async fn oversized_messages_are_fragmented() -> Result<(), Box<dyn std::error::Error>> {
        let (outlet, mut rx) = Outlet::channel(1, Codec::default(), WireFormat::Json, Some(16));
        let env = Envelope::new("publish")
            .with("topic", "/chatter")
            .with("msg", "a fairly long payload that will not fit")
            .with("id", "big");
        assert!(outlet.send(&env));
        drop(outlet);

        let codec = Codec::default();
        let defrag = Defragmenter::default();
        let mut rebuilt = None;
        let mut count = 0;
        while let Some(frame) = rx.recv().await {
            count += 1;
            let part = Fragment::from_envelope(&codec.deserialize(&frame)?)?;
            assert_eq!(part.id, "big");
            if let Some(whole) = defrag.accept(1, part)? {
                rebuilt = Some(codec.deserialize(&whole)?);
            }
        }
        assert!(count > 1);
        assert_eq!(rebuilt, Some(env));
        Ok(())
    }

    #[tokio::test]
    async fn forced_binary_and_entry_fragment_size() -> Result<(), Box<dyn std::error::Error>> {
        let (outlet, mut rx) = Outlet::channel(1, Codec::default(), WireFormat::Json, None);
        let env = Envelope::new("publish").with("msg", WireValue::from("x".repeat(40)));
        assert!(outlet.send_with(&env, Some(10), true));
        drop(outlet);
        let mut frames = Vec::new();
        while let Some(f) = rx.recv().await {
            frames.push(f);
        }
        assert!(frames.len() > 1);
        assert!(frames.iter().all(Frame::is_binary));
        Ok(())
    }

    #[test]
    fn closed_connection_reports_false() {
        let (outlet, rx) = Outlet::channel(1, Codec::default(), WireFormat::Json, None);
        drop(rx);
        assert!(outlet.is_closed());
        assert!(!outlet.send(&Envelope::new("status")));
    }
}
