//! Multiplexed upstream streams
//!
//! A `Stream` is one upstream request (or value subscription) on a responder
//! shared by any number of downstream clients. Each variant keeps its own
//! subscriber set and cache behind its own lock and rewrites the id of every
//! outgoing message to the id the receiving client chose.
//!
//! # Architecture
//!
//! ```text
//!   Responder (per downstream link)
//!   ┌──────────────────────────────────────────────┐
//!   │ StreamManager                                │
//!   │   lists:   ParsedPath ──► rid                │
//!   │   streams: rid ──► Arc<Stream>               │
//!   │ SubscriptionManager                          │
//!   │   paths:   ParsedPath ──► sid                │
//!   │   sids:    sid ──► Arc<Stream>               │
//!   └──────────────────────┬───────────────────────┘
//!                          │ dispatch(response)
//!                          ▼
//!   Stream { cache, subscribers: (session, local id) }
//!          │                 │                 │
//!          ▼                 ▼                 ▼
//!     client A (rid 3)  client B (rid 7)  client C (rid 1)
//! ```
//!
//! Fan-out enqueues onto each client's outbound channel while the stream
//! lock is held, so every subscriber sees a stream's updates in the order the
//! responder produced them. The socket write itself happens on the
//! connection's own task.

pub mod invoke;
pub mod list;
pub mod manager;
pub mod sub;
pub mod subscription;

use std::sync::{Arc, Weak};

pub use invoke::InvokeStream;
pub use list::ListStream;
pub use manager::{ListOutcome, ListStreamManager, StreamManager};
pub use sub::SubStream;
pub use subscription::SubscriptionManager;

use crate::error::Result;
use crate::node::ParsedPath;
use crate::protocol::{Response, StreamStatus, ValueUpdate};
use crate::session::Client;

/// Stream variant tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    List,
    Invoke,
    Sub,
}

/// Stream lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Created, no upstream response yet
    Initialized,
    /// Upstream has answered and the stream is live
    Open,
    /// Terminal
    Closed,
}

impl StreamPhase {
    /// Phase after receiving an upstream response with `status`
    pub(crate) fn advance(self, status: Option<StreamStatus>) -> Self {
        match (self, status) {
            (StreamPhase::Closed, _) => StreamPhase::Closed,
            (_, Some(StreamStatus::Closed)) => StreamPhase::Closed,
            _ => StreamPhase::Open,
        }
    }
}

/// A downstream client attached to a stream under its own id
#[derive(Debug, Clone)]
pub(crate) struct Subscriber {
    client: Weak<Client>,
    local_id: u32,
}

impl Subscriber {
    pub(crate) fn new(client: &Arc<Client>, local_id: u32) -> Self {
        Self {
            client: Arc::downgrade(client),
            local_id,
        }
    }

    pub(crate) fn local_id(&self) -> u32 {
        self.local_id
    }

    pub(crate) fn client(&self) -> Option<Arc<Client>> {
        self.client.upgrade()
    }

    /// Deliver `response` re-addressed to this subscriber's id
    pub(crate) fn deliver(&self, response: &Response) {
        if let Some(client) = self.client() {
            self.send(&client, response.with_rid(self.local_id));
        }
    }

    pub(crate) fn send(&self, client: &Client, response: Response) {
        if let Err(e) = client.writer().send_responses(vec![response]) {
            tracing::debug!(
                session_id = client.session_id(),
                local_id = self.local_id,
                error = %e,
                "Dropping update for closed connection"
            );
        }
    }

    /// Drop the client's bookkeeping for this subscription's request id
    pub(crate) fn forget_request(&self) {
        if let Some(client) = self.client() {
            client.requester().forget_request(self.local_id);
        }
    }
}

/// One multiplexed upstream stream
#[derive(Debug)]
pub enum Stream {
    List(ListStream),
    Invoke(InvokeStream),
    Sub(SubStream),
}

impl Stream {
    pub fn kind(&self) -> StreamKind {
        match self {
            Stream::List(_) => StreamKind::List,
            Stream::Invoke(_) => StreamKind::Invoke,
            Stream::Sub(_) => StreamKind::Sub,
        }
    }

    pub fn path(&self) -> &ParsedPath {
        match self {
            Stream::List(s) => s.path(),
            Stream::Invoke(s) => s.path(),
            Stream::Sub(s) => s.path(),
        }
    }

    /// Upstream id: the rid for list/invoke, the sid for subscriptions
    pub fn id(&self) -> u32 {
        match self {
            Stream::List(s) => s.rid(),
            Stream::Invoke(s) => s.rid(),
            Stream::Sub(s) => s.sid(),
        }
    }

    pub(crate) fn set_id(&self, id: u32) {
        match self {
            Stream::List(s) => s.set_rid(id),
            Stream::Invoke(_) => {}
            Stream::Sub(s) => s.set_sid(id),
        }
    }

    /// Attach `client` under `local_id`, replaying cached state to it
    ///
    /// Returns false if the stream already closed upstream; nothing was
    /// attached and the caller should open a new one.
    pub async fn add(&self, client: &Arc<Client>, local_id: u32) -> Result<bool> {
        match self {
            Stream::List(s) => Ok(s.add(client, local_id).await),
            Stream::Invoke(s) => s.add(client, local_id).await.map(|()| true),
            Stream::Sub(s) => {
                s.add(client, local_id).await;
                Ok(true)
            }
        }
    }

    /// Detach `client`'s `local_id`; detaching an absent pair is a no-op
    ///
    /// Other ids the same client holds on this stream stay attached.
    pub async fn remove(&self, client: &Client, local_id: u32) {
        match self {
            Stream::List(s) => s.remove(client, local_id).await,
            Stream::Invoke(s) => s.remove(client, local_id).await,
            Stream::Sub(s) => s.remove(client, local_id).await,
        }
    }

    pub async fn is_empty(&self) -> bool {
        match self {
            Stream::List(s) => s.is_empty().await,
            Stream::Invoke(s) => s.is_empty().await,
            Stream::Sub(s) => s.is_empty().await,
        }
    }

    pub async fn phase(&self) -> StreamPhase {
        match self {
            Stream::List(s) => s.phase().await,
            Stream::Invoke(s) => s.phase().await,
            Stream::Sub(s) => s.phase().await,
        }
    }

    /// Apply an upstream response and fan it out
    ///
    /// For subscriptions every entry of `updates` is treated as a value
    /// update for this stream.
    pub async fn dispatch(&self, response: &Response) -> StreamPhase {
        match self {
            Stream::List(s) => s.dispatch(response).await,
            Stream::Invoke(s) => s.dispatch(response).await,
            Stream::Sub(s) => {
                for raw in response.updates.iter().flatten() {
                    if let Some(update) = ValueUpdate::from_value(raw) {
                        s.dispatch(&update).await;
                    }
                }
                s.phase().await
            }
        }
    }

    /// The producing responder went away
    pub async fn responder_disconnected(&self, since: &str) {
        match self {
            Stream::List(s) => s.responder_disconnected(since).await,
            Stream::Invoke(s) => s.responder_disconnected().await,
            Stream::Sub(_) => {}
        }
    }
}
