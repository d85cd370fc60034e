//! Wire protocol
//!
//! JSON envelopes exchanged with requesters and responders, plus the
//! reserved ids and attribute names the broker interprets.

pub mod constants;
pub mod message;

pub use message::{
    Envelope, ErrorBody, Method, Request, Response, StreamStatus, SubscribePath, ValueUpdate,
};
