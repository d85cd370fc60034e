//! Invoke streams
//!
//! An invocation belongs to exactly one requester. The broker forwards the
//! request upstream under its own rid and relays every response back under
//! the requester's rid. `set` and `remove` travel the same way as one-shot
//! sessions that the responder closes with its first response.

use std::sync::Arc;

use tokio::sync::Mutex;

use super::{StreamPhase, Subscriber};
use crate::error::{Error, Result};
use crate::node::ParsedPath;
use crate::protocol::Response;
use crate::session::Client;

#[derive(Debug)]
struct InvokeState {
    phase: StreamPhase,
    subscriber: Option<((u64, u32), Subscriber)>,
}

/// Upstream invocation relayed to a single requester
#[derive(Debug)]
pub struct InvokeStream {
    path: ParsedPath,
    rid: u32,
    state: Mutex<InvokeState>,
}

impl InvokeStream {
    pub fn new(rid: u32, path: ParsedPath) -> Self {
        Self {
            path,
            rid,
            state: Mutex::new(InvokeState {
                phase: StreamPhase::Initialized,
                subscriber: None,
            }),
        }
    }

    pub fn path(&self) -> &ParsedPath {
        &self.path
    }

    pub fn rid(&self) -> u32 {
        self.rid
    }

    /// Attach the requester; fails if one is already attached
    pub async fn add(&self, client: &Arc<Client>, local_rid: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.subscriber.is_some() {
            return Err(Error::InvalidState("invoke stream already has a requester"));
        }
        state.subscriber = Some((
            (client.session_id(), local_rid),
            Subscriber::new(client, local_rid),
        ));
        Ok(())
    }

    pub async fn remove(&self, client: &Client, local_rid: u32) {
        let key = (client.session_id(), local_rid);
        let mut state = self.state.lock().await;
        if matches!(&state.subscriber, Some((attached, _)) if *attached == key) {
            state.subscriber = None;
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.subscriber.is_none()
    }

    pub async fn phase(&self) -> StreamPhase {
        self.state.lock().await.phase
    }

    /// Relay `response` to the requester
    pub async fn dispatch(&self, response: &Response) -> StreamPhase {
        let released = {
            let mut state = self.state.lock().await;
            if state.phase == StreamPhase::Closed {
                return StreamPhase::Closed;
            }
            state.phase = state.phase.advance(response.stream);

            if let Some((_, subscriber)) = &state.subscriber {
                subscriber.deliver(response);
            }
            if state.phase != StreamPhase::Closed {
                return state.phase;
            }
            state.subscriber.take()
        };

        if let Some((_, subscriber)) = released {
            subscriber.forget_request();
        }
        StreamPhase::Closed
    }

    /// Close the requester's side; the upstream producer is gone
    pub async fn responder_disconnected(&self) {
        let released = {
            let mut state = self.state.lock().await;
            if state.phase == StreamPhase::Closed {
                return;
            }
            state.phase = StreamPhase::Closed;
            state.subscriber.take()
        };

        if let Some((_, subscriber)) = released {
            if let Some(client) = subscriber.client() {
                subscriber.send(&client, Response::closed(subscriber.local_id()));
            }
            subscriber.forget_request();
            tracing::debug!(
                path = %self.path,
                local_rid = subscriber.local_id(),
                "Invoke closed by responder disconnect"
            );
        }
    }
}
