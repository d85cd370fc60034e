//! Responder side of a downstream link
//!
//! A `Responder` outlives the connections of the link it represents: when
//! the link drops, list and subscription streams stay registered with their
//! caches and are re-requested once the link comes back. Each physical
//! connection gets a fresh [`ResponderLink`] with its own id counters.
//!
//! Lock order: `link` → stream indexes → stream.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::RwLock;

use super::client::{Client, Writer};
use super::tracker::{IdCounter, RequestTracker};
use crate::error::{Error, Result};
use crate::node::ParsedPath;
use crate::protocol::constants::{
    DISCONNECTED_TS_ATTRIBUTE, IS_ATTRIBUTE, NODE_PROFILE, VALUE_UPDATE_RID,
};
use crate::protocol::message::timestamp;
use crate::protocol::{Request, Response, ValueUpdate};
use crate::stream::{ListOutcome, Stream, StreamKind, StreamManager, StreamPhase, SubscriptionManager};

/// One live connection of a responder
#[derive(Debug)]
pub struct ResponderLink {
    writer: Writer,
    rids: RequestTracker,
    sids: IdCounter,
}

impl ResponderLink {
    pub fn new(writer: Writer) -> Self {
        Self {
            writer,
            rids: RequestTracker::new(),
            sids: IdCounter::new(),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.writer.session_id()
    }

    /// Allocate an upstream rid; it stays tracked until released
    pub fn next_rid(&self) -> Result<u32> {
        self.rids.allocate()
    }

    pub fn next_sid(&self) -> u32 {
        self.sids.next()
    }

    pub fn release_rid(&self, rid: u32) -> bool {
        self.rids.untrack(rid)
    }

    pub fn in_flight(&self) -> usize {
        self.rids.len()
    }

    pub fn send(&self, request: Request) -> Result<()> {
        self.writer.send_requests(vec![request])
    }

    pub fn send_all(&self, requests: Vec<Request>) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }
        self.writer.send_requests(requests)
    }
}

/// The broker's view of one downstream link
#[derive(Debug)]
pub struct Responder {
    name: String,
    link: RwLock<Option<Arc<ResponderLink>>>,
    streams: StreamManager,
    subscriptions: SubscriptionManager,
    offline_since: Mutex<Option<String>>,
}

impl Responder {
    /// A responder that has not connected yet
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            link: RwLock::new(None),
            streams: StreamManager::new(),
            subscriptions: SubscriptionManager::new(),
            offline_since: Mutex::new(Some(timestamp())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub async fn link(&self) -> Option<Arc<ResponderLink>> {
        self.link.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.link.read().await.is_some()
    }

    /// Time the link went away, `None` while connected
    pub fn offline_since(&self) -> Option<String> {
        self.offline_since.lock().clone()
    }

    /// Attach a fresh connection and re-request every retained stream
    pub async fn connect(&self, link: Arc<ResponderLink>) -> Result<()> {
        let requests = {
            let mut current = self.link.write().await;
            let mut requests = self.streams.responder_connected(&link).await?;
            requests.extend(self.subscriptions.responder_connected(&link).await?);
            *current = Some(Arc::clone(&link));
            *self.offline_since.lock() = None;
            requests
        };

        tracing::info!(
            link = %self.name,
            session_id = link.session_id(),
            retained = requests.len(),
            "Responder connected"
        );
        if let Err(e) = link.send_all(requests) {
            tracing::warn!(link = %self.name, error = %e, "Failed to re-request retained streams");
        }
        Ok(())
    }

    /// Detach connection `session_id`; false if it is not the live one
    pub async fn disconnect(&self, session_id: u64) -> bool {
        let mut current = self.link.write().await;
        match current.as_ref() {
            Some(link) if link.session_id() == session_id => {}
            _ => return false,
        }
        *current = None;

        let since = timestamp();
        *self.offline_since.lock() = Some(since.clone());
        self.streams.responder_disconnected(&since).await;

        tracing::info!(link = %self.name, session_id = session_id, "Responder disconnected");
        true
    }

    /// List `path` for `client`; `None` when no stream was attached
    pub async fn list(
        &self,
        client: &Arc<Client>,
        local_rid: u32,
        path: &ParsedPath,
    ) -> Result<Option<Arc<Stream>>> {
        let link = self.link.read().await;
        match self
            .streams
            .list(link.as_deref(), client, local_rid, path)
            .await?
        {
            ListOutcome::Attached(stream) => Ok(Some(stream)),
            ListOutcome::Offline => {
                if path.is_link_root() {
                    let since = self.offline_since().unwrap_or_else(timestamp);
                    let updates = vec![
                        json!([IS_ATTRIBUTE, NODE_PROFILE]),
                        json!([DISCONNECTED_TS_ATTRIBUTE, since]),
                    ];
                    client
                        .writer()
                        .send_responses(vec![Response::open(local_rid, updates)])?;
                }
                Ok(None)
            }
        }
    }

    /// Forward an invoke, set or remove upstream
    pub async fn invoke(
        &self,
        client: &Arc<Client>,
        request: &Request,
        path: &ParsedPath,
    ) -> Result<Arc<Stream>> {
        let link = self.link.read().await;
        let Some(link) = link.as_deref() else {
            return Err(Error::Disconnected(self.name.clone()));
        };
        self.streams.invoke(link, client, request, path).await
    }

    /// Subscribe `client` to `path`; held until the link returns if offline
    pub async fn subscribe(
        &self,
        client: &Arc<Client>,
        local_sid: u32,
        path: &ParsedPath,
    ) -> Result<Arc<Stream>> {
        let link = self.link.read().await;
        self.subscriptions
            .subscribe(link.as_deref(), client, local_sid, path)
            .await
    }

    /// Detach `client`'s `local_id` from `stream`, closing the stream
    /// upstream when it empties
    pub async fn close(&self, stream: &Arc<Stream>, client: &Client, local_id: u32) {
        let link = self.link.read().await;
        stream.remove(client, local_id).await;

        let request = match stream.kind() {
            StreamKind::List | StreamKind::Invoke => {
                if !self.streams.release(stream).await {
                    return;
                }
                let Some(link) = link.as_deref() else { return };
                link.release_rid(stream.id());
                Request::close(stream.id())
            }
            StreamKind::Sub => {
                if !self.subscriptions.release(stream).await {
                    return;
                }
                let Some(link) = link.as_deref() else { return };
                match link.next_rid() {
                    Ok(rid) => Request::unsubscribe(rid, vec![stream.id()]),
                    Err(e) => {
                        tracing::warn!(link = %self.name, error = %e, "No rid for unsubscribe");
                        return;
                    }
                }
            }
        };

        tracing::debug!(
            link = %self.name,
            path = %stream.path(),
            method = %request.method,
            "Closing upstream stream"
        );
        if let Some(link) = link.as_deref() {
            if let Err(e) = link.send(request) {
                tracing::debug!(link = %self.name, error = %e, "Upstream close not sent");
            }
        }
    }

    /// Route one response from the link's connection
    pub async fn handle_response(&self, response: Response) {
        if response.rid == VALUE_UPDATE_RID {
            for raw in response.updates.iter().flatten() {
                match ValueUpdate::from_value(raw) {
                    Some(update) => self.subscriptions.dispatch(&update).await,
                    None => tracing::debug!(link = %self.name, "Malformed value update dropped"),
                }
            }
            return;
        }

        let link = self.link.read().await;
        let Some(stream) = self.streams.get(response.rid).await else {
            // Acks for subscribe/unsubscribe and responses to streams
            // already closed by the broker land here
            if response.is_closed() {
                if let Some(link) = link.as_deref() {
                    link.release_rid(response.rid);
                }
            }
            tracing::debug!(link = %self.name, rid = response.rid, "Response for unknown rid");
            return;
        };

        if stream.dispatch(&response).await == StreamPhase::Closed {
            self.streams.remove_closed(&stream).await;
            if let Some(link) = link.as_deref() {
                link.release_rid(response.rid);
            }
        }
    }
}
