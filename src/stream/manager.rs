//! Stream registry and list deduplication
//!
//! `StreamManager` is the per-responder index of live upstream requests.
//! List requests are single-flight: the first requester interested in a
//! path triggers the one upstream `list`, everyone after that attaches to
//! the same stream.
//!
//! Lock order is always `lists.paths` → `streams` → the stream's own lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{InvokeStream, ListStream, Stream, StreamKind};
use crate::error::Result;
use crate::node::ParsedPath;
use crate::protocol::Request;
use crate::session::{Client, ResponderLink};

/// Result of a list request against a responder
#[derive(Debug)]
pub enum ListOutcome {
    /// The requester is attached to this stream
    Attached(Arc<Stream>),
    /// Nothing cached for the path and no responder to ask
    Offline,
}

/// Path → upstream rid index for list streams
#[derive(Debug, Default)]
pub struct ListStreamManager {
    paths: RwLock<HashMap<ParsedPath, u32>>,
}

impl ListStreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lookup(&self, path: &ParsedPath) -> Option<u32> {
        self.paths.read().await.get(path).copied()
    }

    /// Re-key `stream` to `rid`
    pub async fn move_stream(&self, stream: &Stream, rid: u32) {
        let mut paths = self.paths.write().await;
        Self::rekey(&mut paths, stream, rid);
    }

    /// Drop the path entry owned by `stream`
    ///
    /// An entry that already points at a different rid belongs to a newer
    /// stream and is left alone.
    pub async fn remove(&self, stream: &Stream) {
        let mut paths = self.paths.write().await;
        Self::remove_entry(&mut paths, stream);
    }

    pub async fn len(&self) -> usize {
        self.paths.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn rekey(paths: &mut HashMap<ParsedPath, u32>, stream: &Stream, rid: u32) {
        paths.insert(stream.path().clone(), rid);
        stream.set_id(rid);
    }

    fn remove_entry(paths: &mut HashMap<ParsedPath, u32>, stream: &Stream) {
        if paths.get(stream.path()) == Some(&stream.id()) {
            paths.remove(stream.path());
        }
    }
}

/// Upstream requests of one responder, keyed by rid
#[derive(Debug, Default)]
pub struct StreamManager {
    streams: RwLock<HashMap<u32, Arc<Stream>>>,
    lists: ListStreamManager,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lists(&self) -> &ListStreamManager {
        &self.lists
    }

    pub async fn get(&self, rid: u32) -> Option<Arc<Stream>> {
        self.streams.read().await.get(&rid).cloned()
    }

    pub async fn len(&self) -> usize {
        self.streams.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Attach `client` to the list stream for `path`, opening it if needed
    ///
    /// Exactly one upstream `list` is sent per path while anyone is
    /// interested in it, regardless of how many requesters race here. A
    /// stream that closed upstream but is still indexed counts as absent.
    pub async fn list(
        &self,
        link: Option<&ResponderLink>,
        client: &Arc<Client>,
        local_rid: u32,
        path: &ParsedPath,
    ) -> Result<ListOutcome> {
        {
            let paths = self.lists.paths.read().await;
            if let Some(&rid) = paths.get(path) {
                if let Some(stream) = self.attach(rid, path, client, local_rid).await? {
                    return Ok(ListOutcome::Attached(stream));
                }
            }
        }

        let mut paths = self.lists.paths.write().await;
        // Another requester may have opened the path while we waited
        if let Some(&rid) = paths.get(path) {
            if let Some(stream) = self.attach(rid, path, client, local_rid).await? {
                return Ok(ListOutcome::Attached(stream));
            }
            // Closed by the responder, not yet unregistered
            paths.remove(path);
            self.streams.write().await.remove(&rid);
            tracing::debug!(path = %path, rid = rid, "Replacing closed list stream");
        }

        let Some(link) = link else {
            return Ok(ListOutcome::Offline);
        };

        let rid = link.next_rid()?;
        paths.insert(path.clone(), rid);
        let stream = Arc::new(Stream::List(ListStream::new(rid, path.clone())));
        stream.add(client, local_rid).await?;
        self.streams.write().await.insert(rid, Arc::clone(&stream));

        tracing::info!(path = %path, rid = rid, "List stream opened");
        if let Err(e) = link.send(Request::list(rid, path.base())) {
            // The link is going away; its reconnect re-issues the list
            tracing::warn!(path = %path, rid = rid, error = %e, "Failed to send upstream list");
        }

        Ok(ListOutcome::Attached(stream))
    }

    /// Open a dedicated stream for a one-requester method
    pub async fn invoke(
        &self,
        link: &ResponderLink,
        client: &Arc<Client>,
        request: &Request,
        path: &ParsedPath,
    ) -> Result<Arc<Stream>> {
        let rid = link.next_rid()?;
        let stream = Arc::new(Stream::Invoke(InvokeStream::new(rid, path.clone())));
        stream.add(client, request.rid).await?;
        self.streams.write().await.insert(rid, Arc::clone(&stream));

        if let Err(e) = link.send(request.forward(rid, path.base())) {
            self.remove_id(&stream).await;
            link.release_rid(rid);
            return Err(e);
        }
        tracing::debug!(
            path = %path,
            rid = rid,
            method = %request.method,
            "Forwarded request upstream"
        );
        Ok(stream)
    }

    /// Attach to the indexed stream for `rid`; `None` if it already closed
    async fn attach(
        &self,
        rid: u32,
        path: &ParsedPath,
        client: &Arc<Client>,
        local_rid: u32,
    ) -> Result<Option<Arc<Stream>>> {
        let stream = self.list_stream(rid, path).await;
        Ok(stream.add(client, local_rid).await?.then_some(stream))
    }

    async fn list_stream(&self, rid: u32, path: &ParsedPath) -> Arc<Stream> {
        if let Some(stream) = self.streams.read().await.get(&rid) {
            return Arc::clone(stream);
        }
        let mut streams = self.streams.write().await;
        Arc::clone(
            streams
                .entry(rid)
                .or_insert_with(|| Arc::new(Stream::List(ListStream::new(rid, path.clone())))),
        )
    }

    /// Unregister `stream` if it has no subscribers left
    ///
    /// Returns true when the stream was removed and the caller should close
    /// it upstream. The emptiness check runs under the path write lock so a
    /// requester attaching concurrently keeps the stream alive.
    pub async fn release(&self, stream: &Arc<Stream>) -> bool {
        match stream.kind() {
            StreamKind::List => {
                let mut paths = self.lists.paths.write().await;
                if !stream.is_empty().await {
                    return false;
                }
                ListStreamManager::remove_entry(&mut paths, stream);
                self.remove_id(stream).await
            }
            StreamKind::Invoke => stream.is_empty().await && self.remove_id(stream).await,
            StreamKind::Sub => false,
        }
    }

    /// Unregister a stream the responder closed
    pub async fn remove_closed(&self, stream: &Arc<Stream>) {
        if stream.kind() == StreamKind::List {
            self.lists.remove(stream).await;
        }
        self.remove_id(stream).await;
        tracing::debug!(path = %stream.path(), rid = stream.id(), "Stream removed");
    }

    async fn remove_id(&self, stream: &Arc<Stream>) -> bool {
        let mut streams = self.streams.write().await;
        match streams.get(&stream.id()) {
            Some(current) if Arc::ptr_eq(current, stream) => {
                streams.remove(&stream.id());
                true
            }
            _ => false,
        }
    }

    /// Re-key every retained list stream onto a fresh connection
    ///
    /// Returns the upstream `list` requests to send. Streams nobody is
    /// attached to any more are dropped instead.
    pub async fn responder_connected(&self, link: &ResponderLink) -> Result<Vec<Request>> {
        let mut paths = self.lists.paths.write().await;
        let mut streams = self.streams.write().await;

        let retained: Vec<Arc<Stream>> = streams.drain().map(|(_, s)| s).collect();
        let mut requests = Vec::new();

        for stream in retained {
            if stream.kind() != StreamKind::List || stream.is_empty().await {
                ListStreamManager::remove_entry(&mut paths, &stream);
                continue;
            }
            let rid = link.next_rid()?;
            ListStreamManager::rekey(&mut paths, &stream, rid);
            requests.push(Request::list(rid, stream.path().base()));
            streams.insert(rid, stream);
        }

        Ok(requests)
    }

    /// Close invocations and mark list streams after the responder left
    ///
    /// List streams keep their cache and subscribers until the link returns.
    pub async fn responder_disconnected(&self, since: &str) {
        let (invokes, lists) = {
            let mut streams = self.streams.write().await;
            let mut invokes = Vec::new();
            streams.retain(|_, stream| {
                if stream.kind() == StreamKind::Invoke {
                    invokes.push(Arc::clone(stream));
                    false
                } else {
                    true
                }
            });
            (invokes, streams.values().cloned().collect::<Vec<_>>())
        };

        for stream in invokes {
            stream.responder_disconnected(since).await;
        }
        for stream in lists {
            stream.responder_disconnected(since).await;
        }
    }
}
