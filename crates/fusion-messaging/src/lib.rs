//! Topic-based publish/subscribe fabric used by every coordination component.
//!
//! Components exchange task assignments, executor reports and lifecycle
//! notices as [`fusion_core::Event`]s on dot-separated topics. Subscribers
//! register patterns and drain their own queue asynchronously.
//!
//! # Main types
//!
//! - [`MessageRouter`] — Publishes events to every matching subscription.
//! - [`Subscription`] — The receiving end of one subscription.
//! - [`TopicPattern`] — Exact, `*` (one segment) and trailing `#` patterns.

/// Topic pattern parsing and matching.
pub mod pattern;
/// Router and subscriptions.
pub mod router;

pub use pattern::{validate_topic, TopicPattern};
pub use router::{MessageRouter, Subscription, SubscriptionId};
