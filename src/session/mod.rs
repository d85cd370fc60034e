//! Connection-scoped state
//!
//! - [`Client`]: one authenticated connection and its outbound sink
//! - [`Requester`]: the client's rids and sids mapped to streams
//! - [`Responder`]: a downstream link, its streams and its live connection
//! - trackers: per-connection id counters and in-flight bookkeeping

pub mod client;
pub mod requester;
pub mod responder;
pub mod tracker;

pub use client::{Client, ClientIdentity, ClientPhase, Writer};
pub use requester::{Attachment, Requester};
pub use responder::{Responder, ResponderLink};
pub use tracker::{IdCounter, RequestTracker, ResponseTracker};
