//! Requester side of a client connection
//!
//! Maps the client's own rids and sids to the streams serving them. The
//! client picks these ids; they only have to be unique within its
//! connection.

use std::sync::Arc;

use super::client::Client;
use super::responder::Responder;
use super::tracker::ResponseTracker;
use crate::error::{Error, Result};
use crate::node::ParsedPath;
use crate::protocol::{Method, Request, Response, SubscribePath};
use crate::server::Broker;
use crate::stream::{Stream, StreamPhase};

/// A stream a client id is attached to, and the responder that owns it
#[derive(Debug, Clone)]
pub struct Attachment {
    pub stream: Arc<Stream>,
    pub responder: Arc<Responder>,
}

impl Attachment {
    async fn detach(&self, client: &Client, local_id: u32) {
        self.responder.close(&self.stream, client, local_id).await;
    }
}

/// Per-connection request bookkeeping
#[derive(Debug)]
pub struct Requester {
    requests: ResponseTracker<Attachment>,
    subscriptions: ResponseTracker<Attachment>,
}

impl Requester {
    pub fn new() -> Self {
        Self {
            requests: ResponseTracker::new("rid"),
            subscriptions: ResponseTracker::new("sid"),
        }
    }

    pub fn open_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn open_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    /// Handle one request, returning the direct reply if there is one
    ///
    /// Failures are scoped to the request: they come back as a closed
    /// response carrying the error.
    pub async fn handle(
        &self,
        client: &Arc<Client>,
        broker: &Broker,
        request: Request,
    ) -> Option<Response> {
        match self.route(client, broker, &request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    session_id = client.session_id(),
                    rid = request.rid,
                    method = %request.method,
                    error = %e,
                    "Request rejected"
                );
                Some(e.to_response(request.rid))
            }
        }
    }

    async fn route(
        &self,
        client: &Arc<Client>,
        broker: &Broker,
        request: &Request,
    ) -> Result<Option<Response>> {
        tracing::debug!(
            session_id = client.session_id(),
            rid = request.rid,
            method = %request.method,
            path = request.path.as_deref().unwrap_or(""),
            "Request"
        );

        match request.method()? {
            Method::List => self.list(client, broker, request).await,
            Method::Invoke | Method::Set | Method::Remove => {
                self.invoke(client, broker, request).await
            }
            Method::Subscribe => self.subscribe(client, broker, request).await,
            Method::Unsubscribe => self.unsubscribe(client, request).await,
            Method::Close => {
                self.close(client, request.rid).await;
                Ok(None)
            }
        }
    }

    async fn list(
        &self,
        client: &Arc<Client>,
        broker: &Broker,
        request: &Request,
    ) -> Result<Option<Response>> {
        let path = request_path(broker, request)?;
        if !path.is_remote() {
            self.requests.check(request.rid)?;
            return broker.list_local(request.rid, &path).map(Some);
        }

        self.requests.reserve(request.rid)?;
        let opened = async {
            let responder = remote_responder(broker, &path).await?;
            let stream = responder.list(client, request.rid, &path).await?;
            Ok::<_, Error>(stream.map(|stream| Attachment { stream, responder }))
        }
        .await;
        self.settle(client, request.rid, opened).await?;
        Ok(None)
    }

    async fn invoke(
        &self,
        client: &Arc<Client>,
        broker: &Broker,
        request: &Request,
    ) -> Result<Option<Response>> {
        let path = request_path(broker, request)?;
        if !path.is_remote() {
            return Err(Error::LocalMethod(request.method.clone()));
        }

        self.requests.reserve(request.rid)?;
        let opened = async {
            let responder = remote_responder(broker, &path).await?;
            let stream = responder.invoke(client, request, &path).await?;
            Ok::<_, Error>(Some(Attachment { stream, responder }))
        }
        .await;
        self.settle(client, request.rid, opened).await?;
        Ok(None)
    }

    /// Fill or release the reservation for `rid`
    ///
    /// A reservation that vanished while the stream was being opened means
    /// the connection is being torn down; the stream is detached again. A
    /// stream that closed while we attached is not tracked.
    async fn settle(
        &self,
        client: &Client,
        rid: u32,
        opened: Result<Option<Attachment>>,
    ) -> Result<()> {
        let attachment = match opened {
            Ok(Some(attachment)) => attachment,
            Ok(None) => {
                self.requests.untrack(rid);
                return Ok(());
            }
            Err(e) => {
                self.requests.untrack(rid);
                return Err(e);
            }
        };

        if !self.requests.fill(rid, attachment.clone()) {
            attachment.detach(client, rid).await;
            return Ok(());
        }
        if attachment.stream.phase().await == StreamPhase::Closed {
            self.requests.untrack(rid);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        client: &Arc<Client>,
        broker: &Broker,
        request: &Request,
    ) -> Result<Option<Response>> {
        let paths = request
            .paths
            .as_ref()
            .ok_or(Error::MalformedRequest("subscribe requires paths"))?;

        for (i, entry) in paths.iter().enumerate() {
            if let Err(e) = self.subscriptions.reserve(entry.sid) {
                for reserved in &paths[..i] {
                    self.subscriptions.untrack(reserved.sid);
                }
                return Err(e);
            }
        }

        for (i, entry) in paths.iter().enumerate() {
            match self.open_subscription(client, broker, entry).await {
                Ok(Some(attachment)) => {
                    if !self.subscriptions.fill(entry.sid, attachment.clone()) {
                        attachment.detach(client, entry.sid).await;
                    }
                }
                Ok(None) => {
                    self.subscriptions.untrack(entry.sid);
                }
                Err(e) => {
                    for pending in &paths[i..] {
                        self.subscriptions.untrack(pending.sid);
                    }
                    return Err(e);
                }
            }
        }

        Ok(Some(Response::closed(request.rid)))
    }

    async fn open_subscription(
        &self,
        client: &Arc<Client>,
        broker: &Broker,
        entry: &SubscribePath,
    ) -> Result<Option<Attachment>> {
        let path = broker.parse_path(&entry.path);
        if !path.is_remote() {
            tracing::debug!(path = %path, sid = entry.sid, "Subscribe to local node ignored");
            return Ok(None);
        }
        let Some(link) = path.link() else {
            return Ok(None);
        };
        let Some(responder) = broker.responder(link).await else {
            tracing::debug!(path = %path, sid = entry.sid, "Subscribe to unknown link ignored");
            return Ok(None);
        };

        let stream = responder.subscribe(client, entry.sid, &path).await?;
        Ok(Some(Attachment { stream, responder }))
    }

    async fn unsubscribe(&self, client: &Arc<Client>, request: &Request) -> Result<Option<Response>> {
        let sids = request
            .sids
            .as_ref()
            .ok_or(Error::MalformedRequest("unsubscribe requires sids"))?;

        for sid in sids {
            if let Some(attachment) = self.subscriptions.untrack(*sid) {
                attachment.detach(client, *sid).await;
            }
        }
        Ok(Some(Response::closed(request.rid)))
    }

    /// Detach the stream behind `rid`; unknown rids are ignored
    pub async fn close(&self, client: &Client, rid: u32) {
        if let Some(attachment) = self.requests.untrack(rid) {
            attachment.detach(client, rid).await;
        }
    }

    /// Forget `rid` after its stream closed on its own
    pub fn forget_request(&self, rid: u32) {
        if self.requests.untrack(rid).is_some() {
            tracing::debug!(rid = rid, "Request closed by responder");
        }
    }

    /// Detach every stream this client is attached to
    pub async fn detach_all(&self, client: &Client) {
        for (rid, attachment) in self.requests.drain() {
            attachment.detach(client, rid).await;
        }
        for (sid, attachment) in self.subscriptions.drain() {
            attachment.detach(client, sid).await;
        }
    }
}

impl Default for Requester {
    fn default() -> Self {
        Self::new()
    }
}

fn request_path(broker: &Broker, request: &Request) -> Result<ParsedPath> {
    let raw = request
        .path
        .as_deref()
        .ok_or(Error::MalformedRequest("request requires a path"))?;
    Ok(broker.parse_path(raw))
}

async fn remote_responder(broker: &Broker, path: &ParsedPath) -> Result<Arc<Responder>> {
    let link = path
        .link()
        .ok_or_else(|| Error::PathNotFound(path.full().to_string()))?;
    broker
        .responder(link)
        .await
        .ok_or_else(|| Error::PathNotFound(path.full().to_string()))
}
