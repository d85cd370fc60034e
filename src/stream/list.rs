//! List streams
//!
//! A list stream mirrors one node's children and attributes. The cache holds
//! the latest entry per name so a late joiner gets the whole node in one
//! message instead of waiting for the responder to resend it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::{StreamPhase, Subscriber};
use crate::node::ParsedPath;
use crate::protocol::constants::{CHANGE_REMOVE, DISCONNECTED_TS_ATTRIBUTE, IS_ATTRIBUTE};
use crate::protocol::{Response, StreamStatus};
use crate::session::Client;

/// How a single list entry affects the cache
#[derive(Debug, Clone, PartialEq)]
pub enum ListChange<'a> {
    /// `$is` changed: everything cached so far is stale
    Reset,
    /// Child or attribute removed
    Remove(&'a str),
    /// Child or attribute added or changed
    Upsert(&'a str),
}

impl<'a> ListChange<'a> {
    /// Classify `[name, value]` and `{"name": .., "change": ..}` entries
    pub fn classify(entry: &'a Value) -> Option<Self> {
        let (name, removed) = match entry {
            Value::Array(items) => (items.first()?.as_str()?, false),
            Value::Object(map) => (
                map.get("name")?.as_str()?,
                map.get("change").and_then(Value::as_str) == Some(CHANGE_REMOVE),
            ),
            _ => return None,
        };

        Some(if removed {
            ListChange::Remove(name)
        } else if name == IS_ATTRIBUTE {
            ListChange::Reset
        } else {
            ListChange::Upsert(name)
        })
    }
}

#[derive(Debug)]
struct ListState {
    phase: StreamPhase,
    cache: HashMap<String, Value>,
    subscribers: HashMap<(u64, u32), Subscriber>,
}

impl ListState {
    fn apply(&mut self, entry: &Value) {
        match ListChange::classify(entry) {
            Some(ListChange::Reset) => {
                self.cache.clear();
                self.cache.insert(IS_ATTRIBUTE.to_string(), entry.clone());
            }
            Some(ListChange::Remove(name)) => {
                self.cache.remove(name);
            }
            Some(ListChange::Upsert(name)) => {
                self.cache.insert(name.to_string(), entry.clone());
            }
            None => {
                tracing::debug!(entry = %entry, "Ignoring malformed list entry");
            }
        }
    }

    /// Cached entries with `$is` first
    fn snapshot(&self) -> Vec<Value> {
        let mut entries = Vec::with_capacity(self.cache.len());
        if let Some(is) = self.cache.get(IS_ATTRIBUTE) {
            entries.push(is.clone());
        }
        entries.extend(
            self.cache
                .iter()
                .filter(|(name, _)| name.as_str() != IS_ATTRIBUTE)
                .map(|(_, entry)| entry.clone()),
        );
        entries
    }
}

/// Shared `list` request
#[derive(Debug)]
pub struct ListStream {
    path: ParsedPath,
    rid: AtomicU32,
    state: Mutex<ListState>,
}

impl ListStream {
    pub fn new(rid: u32, path: ParsedPath) -> Self {
        Self {
            path,
            rid: AtomicU32::new(rid),
            state: Mutex::new(ListState {
                phase: StreamPhase::Initialized,
                cache: HashMap::new(),
                subscribers: HashMap::new(),
            }),
        }
    }

    pub fn path(&self) -> &ParsedPath {
        &self.path
    }

    pub fn rid(&self) -> u32 {
        self.rid.load(Ordering::Acquire)
    }

    pub(crate) fn set_rid(&self, rid: u32) {
        self.rid.store(rid, Ordering::Release);
    }

    /// Attach `client` under `local_rid`; a non-empty cache is replayed to
    /// it as one message
    ///
    /// Returns false without attaching once the stream has closed upstream.
    pub async fn add(&self, client: &Arc<Client>, local_rid: u32) -> bool {
        let mut state = self.state.lock().await;
        if state.phase == StreamPhase::Closed {
            return false;
        }
        let subscriber = Subscriber::new(client, local_rid);

        if !state.cache.is_empty() {
            subscriber.send(client, Response::open(local_rid, state.snapshot()));
        }
        state
            .subscribers
            .insert((client.session_id(), local_rid), subscriber);

        tracing::debug!(
            path = %self.path,
            session_id = client.session_id(),
            local_rid = local_rid,
            subscribers = state.subscribers.len(),
            "List subscriber added"
        );
        true
    }

    pub async fn remove(&self, client: &Client, local_rid: u32) {
        let mut state = self.state.lock().await;
        if state
            .subscribers
            .remove(&(client.session_id(), local_rid))
            .is_some()
        {
            tracing::debug!(
                path = %self.path,
                session_id = client.session_id(),
                local_rid = local_rid,
                subscribers = state.subscribers.len(),
                "List subscriber removed"
            );
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.subscribers.is_empty()
    }

    pub async fn phase(&self) -> StreamPhase {
        self.state.lock().await.phase
    }

    /// Cached entries, `$is` first
    pub async fn snapshot(&self) -> Vec<Value> {
        self.state.lock().await.snapshot()
    }

    /// Apply `response` to the cache and fan it out
    ///
    /// On close every subscriber is detached and told to forget its rid.
    pub async fn dispatch(&self, response: &Response) -> StreamPhase {
        let closing = {
            let mut state = self.state.lock().await;
            if state.phase == StreamPhase::Closed {
                return StreamPhase::Closed;
            }

            for entry in response.updates.iter().flatten() {
                state.apply(entry);
            }
            state.phase = state.phase.advance(response.stream);

            for subscriber in state.subscribers.values() {
                subscriber.deliver(response);
            }

            if state.phase != StreamPhase::Closed {
                return state.phase;
            }
            state.subscribers.drain().map(|(_, s)| s).collect::<Vec<_>>()
        };

        for subscriber in closing {
            subscriber.forget_request();
        }
        tracing::debug!(path = %self.path, rid = self.rid(), "List stream closed upstream");
        StreamPhase::Closed
    }

    /// Record the link's offline time on its root node
    ///
    /// Deeper nodes keep their cache untouched until the link returns.
    pub async fn responder_disconnected(&self, since: &str) {
        if !self.path.is_link_root() {
            return;
        }

        let entry = json!([DISCONNECTED_TS_ATTRIBUTE, since]);
        let mut state = self.state.lock().await;
        state.apply(&entry);

        let response = Response {
            stream: Some(StreamStatus::Open),
            updates: Some(vec![entry]),
            ..Response::default()
        };
        for subscriber in state.subscribers.values() {
            subscriber.deliver(&response);
        }
    }
}
