//! `linkbridge-middleware` – the protocol dispatch core.
//!
//! Turns frames from a client connection into operations on a pub/sub
//! [`Bus`] and turns bus traffic back into frames, without caring what the
//! messages mean.
//!
//! # Modules
//!
//! - [`bus`] – the narrow bus interface and the in-process [`LocalBus`].
//! - [`codec`] / [`negotiate`] – wire formats and `Accept` negotiation.
//! - [`fragment`] – splitting and reassembly of oversized messages.
//! - [`publishers`] / [`subscribers`] / [`services`] – shared,
//!   reference-counted registrations behind the per-client entries.
//! - [`capability`] – the opcode handlers.
//! - [`protocol`] – per-connection state, dispatch and teardown.

pub mod access;
pub mod bus;
pub mod capability;
pub mod codec;
pub mod counter;
pub mod fragment;
pub mod negotiate;
pub mod outlet;
pub mod protocol;
pub mod publishers;
pub mod services;
pub mod subscribers;

pub use access::NameFilter;
pub use bus::{Bus, BusCallback, BusHandle, LocalBus};
pub use capability::Capability;
pub use codec::{Codec, DecodeError, Frame, WireFormat};
pub use counter::AtomicCounter;
pub use negotiate::negotiate;
pub use outlet::Outlet;
pub use protocol::{Bridge, Protocol, ProtocolSettings, TeardownHook};
pub use publishers::EntryKey;
pub use subscribers::{Compression, MessageSink, SubscriberOptions};
