//! `linkbridge-notify` – pushes topic updates to delivery targets that sit
//! outside the protocol's own subscription path: HTTP webhooks and
//! push-socket connections.
//!
//! A [`NotificationEngine`] owns the registered [`DeliveryTarget`]s and a
//! background loop that polls each target's [`UpdateSource`], encodes what is
//! new through an [`Encoder`] and hands the result to a bounded pool of
//! delivery tasks.

pub mod engine;
pub mod feeds;
pub mod source;
pub mod target;

pub use engine::{CycleReport, Encoder, EngineConfig, EnvelopeEncoder, NotificationEngine, UpdateHook};
pub use feeds::TopicFeeds;
pub use source::{LatestValue, Update, UpdateSource};
pub use target::{DeliveryTarget, Payload, TargetKind};
