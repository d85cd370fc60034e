//! Value subscription streams

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::{StreamPhase, Subscriber};
use crate::node::ParsedPath;
use crate::protocol::{Response, ValueUpdate};
use crate::session::Client;

#[derive(Debug)]
struct SubState {
    last: Option<ValueUpdate>,
    subscribers: HashMap<(u64, u32), Subscriber>,
}

/// One upstream value subscription shared by many clients
///
/// Only the latest value is cached; there is no history.
#[derive(Debug)]
pub struct SubStream {
    path: ParsedPath,
    sid: AtomicU32,
    state: Mutex<SubState>,
}

impl SubStream {
    pub fn new(sid: u32, path: ParsedPath) -> Self {
        Self {
            path,
            sid: AtomicU32::new(sid),
            state: Mutex::new(SubState {
                last: None,
                subscribers: HashMap::new(),
            }),
        }
    }

    pub fn path(&self) -> &ParsedPath {
        &self.path
    }

    pub fn sid(&self) -> u32 {
        self.sid.load(Ordering::Acquire)
    }

    pub(crate) fn set_sid(&self, sid: u32) {
        self.sid.store(sid, Ordering::Release);
    }

    /// Attach `client` under its own sid, replaying the cached value
    pub async fn add(&self, client: &Arc<Client>, local_sid: u32) {
        let mut state = self.state.lock().await;
        let subscriber = Subscriber::new(client, local_sid);

        if let Some(last) = &state.last {
            subscriber.send(client, Response::values(vec![last.with_sid(local_sid)]));
        }
        state
            .subscribers
            .insert((client.session_id(), local_sid), subscriber);
    }

    pub async fn remove(&self, client: &Client, local_sid: u32) {
        self.state
            .lock()
            .await
            .subscribers
            .remove(&(client.session_id(), local_sid));
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.subscribers.is_empty()
    }

    /// Open once a value has been seen
    pub async fn phase(&self) -> StreamPhase {
        if self.state.lock().await.last.is_some() {
            StreamPhase::Open
        } else {
            StreamPhase::Initialized
        }
    }

    pub async fn last_value(&self) -> Option<ValueUpdate> {
        self.state.lock().await.last.clone()
    }

    /// Cache `update` and send each subscriber its own copy
    pub async fn dispatch(&self, update: &ValueUpdate) {
        let mut state = self.state.lock().await;
        state.last = Some(update.clone());

        for subscriber in state.subscribers.values() {
            if let Some(client) = subscriber.client() {
                let entry = update.with_sid(subscriber.local_id());
                subscriber.send(&client, Response::values(vec![entry]));
            }
        }
    }
}
