//! Error types
//!
//! A single error enum covers the broker. Most variants are scoped to one
//! request and end up in that request's response `error` field; only
//! connection-level failures (`ConnectionClosed`, `NotConnected`) affect the
//! connection itself.

use crate::protocol::message::{ErrorBody, Response, StreamStatus};

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Broker error
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Method name not recognized
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    /// The same request or subscription id was tracked twice
    #[error("{kind} {id} is already tracked")]
    DuplicateTracking { kind: &'static str, id: u32 },

    /// Operation not valid in the stream's current state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Path does not resolve to an accessible node
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// Method cannot be served by the broker's own tree
    #[error("method not supported on local node: {0}")]
    LocalMethod(String),

    /// The responder serving the path is not connected
    #[error("link {0} is disconnected")]
    Disconnected(String),

    /// Request is missing a required field
    #[error("malformed request: {0}")]
    MalformedRequest(&'static str),

    /// Client was not pending (already confirmed or evicted)
    #[error("client {0} is not pending")]
    NotPending(String),

    /// Client sent traffic before its handshake completed
    #[error("client {0} is not connected")]
    NotConnected(String),

    /// Connection limit reached
    #[error("connection limit reached ({0})")]
    ConnectionLimit(usize),

    /// The peer's outbound channel has been closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Envelope could not be encoded or decoded
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build the closed response reporting this error for `rid`
    pub fn to_response(&self, rid: u32) -> Response {
        let msg = match self {
            Error::UnsupportedMethod(_) => "Unsupported method",
            Error::DuplicateTracking { .. } => "Duplicate request id",
            Error::InvalidState(_) => "Invalid state",
            Error::PathNotFound(_) => "Path not found",
            Error::LocalMethod(_) => "Method not supported on local node",
            Error::Disconnected(_) => "Disconnected",
            Error::MalformedRequest(_) => "Malformed request",
            _ => "Internal error",
        };

        Response {
            rid,
            stream: Some(StreamStatus::Closed),
            error: Some(ErrorBody {
                msg: msg.to_string(),
                detail: Some(self.to_string()),
            }),
            ..Response::default()
        }
    }
}
