//! HTTP handlers
//!
//! The federation-facing routes: webfinger, actor documents, inboxes,
//! outboxes, collections, attachment serving, and metrics.

pub mod activitypub;
pub mod wellknown;

pub use activitypub::activitypub_router;
pub use wellknown::wellknown_router;
