//! Value subscription index
//!
//! Same single-flight discipline as list streams: one upstream `subscribe`
//! per path per responder, however many requesters subscribe to it.
//!
//! Subscribing while the link is offline registers the stream under a
//! placeholder sid; the reconnect assigns the real sid and sends the
//! `subscribe`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{Stream, SubStream};
use crate::error::Result;
use crate::node::ParsedPath;
use crate::protocol::{Request, ValueUpdate};
use crate::session::{Client, IdCounter, ResponderLink};

/// Placeholder sids live above anything a link's counter hands out
const PLACEHOLDER_SID_BASE: u32 = 1 << 31;

/// Path → upstream sid and sid → stream for one responder
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    paths: RwLock<HashMap<ParsedPath, u32>>,
    sids: RwLock<HashMap<u32, Arc<Stream>>>,
    placeholders: IdCounter,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, sid: u32) -> Option<Arc<Stream>> {
        self.sids.read().await.get(&sid).cloned()
    }

    pub async fn lookup(&self, path: &ParsedPath) -> Option<u32> {
        self.paths.read().await.get(path).copied()
    }

    pub async fn len(&self) -> usize {
        self.sids.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Attach `client` under `local_sid` to the subscription for `path`
    ///
    /// Without a live link the stream is registered and waits for
    /// [`SubscriptionManager::responder_connected`].
    pub async fn subscribe(
        &self,
        link: Option<&ResponderLink>,
        client: &Arc<Client>,
        local_sid: u32,
        path: &ParsedPath,
    ) -> Result<Arc<Stream>> {
        {
            let paths = self.paths.read().await;
            if let Some(&sid) = paths.get(path) {
                return self.attach(sid, path, client, local_sid).await;
            }
        }

        let mut paths = self.paths.write().await;
        if let Some(&sid) = paths.get(path) {
            return self.attach(sid, path, client, local_sid).await;
        }

        let Some(link) = link else {
            let sid = PLACEHOLDER_SID_BASE | self.placeholders.next();
            paths.insert(path.clone(), sid);
            tracing::debug!(path = %path, "Subscription deferred until link connects");
            return self.attach(sid, path, client, local_sid).await;
        };

        let sid = link.next_sid();
        let rid = link.next_rid()?;
        paths.insert(path.clone(), sid);
        let stream = self.attach(sid, path, client, local_sid).await?;

        tracing::info!(path = %path, sid = sid, "Subscription opened");
        if let Err(e) = link.send(Request::subscribe(rid, path.base(), sid)) {
            tracing::warn!(path = %path, sid = sid, error = %e, "Failed to send upstream subscribe");
        }

        Ok(stream)
    }

    async fn attach(
        &self,
        sid: u32,
        path: &ParsedPath,
        client: &Arc<Client>,
        local_sid: u32,
    ) -> Result<Arc<Stream>> {
        let stream = {
            let mut sids = self.sids.write().await;
            Arc::clone(
                sids.entry(sid)
                    .or_insert_with(|| Arc::new(Stream::Sub(SubStream::new(sid, path.clone())))),
            )
        };
        stream.add(client, local_sid).await?;
        Ok(stream)
    }

    /// Route one entry of the value channel; unknown sids are dropped
    pub async fn dispatch(&self, update: &ValueUpdate) {
        let Some(stream) = self.get(update.sid()).await else {
            tracing::debug!(sid = update.sid(), "Value for unknown sid dropped");
            return;
        };
        if let Stream::Sub(sub) = stream.as_ref() {
            sub.dispatch(update).await;
        }
    }

    /// Unregister `stream` if nobody is subscribed any more
    ///
    /// Returns true when the caller should unsubscribe upstream.
    pub async fn release(&self, stream: &Arc<Stream>) -> bool {
        let mut paths = self.paths.write().await;
        if !stream.is_empty().await {
            return false;
        }
        if paths.get(stream.path()) == Some(&stream.id()) {
            paths.remove(stream.path());
        }

        let mut sids = self.sids.write().await;
        match sids.get(&stream.id()) {
            Some(current) if Arc::ptr_eq(current, stream) => {
                sids.remove(&stream.id());
                tracing::debug!(path = %stream.path(), sid = stream.id(), "Subscription removed");
                true
            }
            _ => false,
        }
    }

    /// Re-key retained and deferred subscriptions onto a fresh connection
    ///
    /// Returns the upstream `subscribe` requests to send.
    pub async fn responder_connected(&self, link: &ResponderLink) -> Result<Vec<Request>> {
        let mut paths = self.paths.write().await;
        let mut sids = self.sids.write().await;

        let retained: Vec<Arc<Stream>> = sids.drain().map(|(_, s)| s).collect();
        paths.clear();
        let mut requests = Vec::new();

        for stream in retained {
            if stream.is_empty().await {
                continue;
            }
            let sid = link.next_sid();
            stream.set_id(sid);
            paths.insert(stream.path().clone(), sid);
            requests.push(Request::subscribe(link.next_rid()?, stream.path().base(), sid));
            sids.insert(sid, stream);
        }

        Ok(requests)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::protocol::Envelope;
    use crate::session::{ClientIdentity, Writer};

    fn client(id: u64) -> (Arc<Client>, UnboundedReceiver<Bytes>) {
        Client::new(id, ClientIdentity::new(format!("c-{id}"), format!("c{id}")))
    }

    fn link(session_id: u64) -> (ResponderLink, UnboundedReceiver<Bytes>) {
        let (writer, rx) = Writer::channel(session_id);
        (ResponderLink::new(writer), rx)
    }

    fn requests(rx: &mut UnboundedReceiver<Bytes>) -> Vec<Request> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.extend(Envelope::decode(&frame).unwrap().requests);
        }
        out
    }

    #[tokio::test]
    async fn test_subscribe_dedup() {
        let subs = SubscriptionManager::new();
        let (link, mut upstream) = link(100);
        let temp = ParsedPath::parse("downstream", "/downstream/a/temp");
        let (a, mut rx_a) = client(1);
        let (b, mut rx_b) = client(2);

        let first = subs.subscribe(Some(&link), &a, 4, &temp).await.unwrap();
        let second = subs.subscribe(Some(&link), &b, 8, &temp).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let sent = requests(&mut upstream);
        assert_eq!(sent.len(), 1);
        let paths = sent[0].paths.as_ref().unwrap();
        assert_eq!(paths[0].path, "/temp");
        assert_eq!(paths[0].sid, first.id());

        let update = ValueUpdate::from_value(&json!([first.id(), 3, "ts"])).unwrap();
        subs.dispatch(&update).await;

        let got_a = Envelope::decode(&rx_a.try_recv().unwrap()).unwrap();
        let got_b = Envelope::decode(&rx_b.try_recv().unwrap()).unwrap();
        assert_eq!(got_a.responses[0].updates.as_ref().unwrap()[0], json!([4, 3, "ts"]));
        assert_eq!(got_b.responses[0].updates.as_ref().unwrap()[0], json!([8, 3, "ts"]));
    }

    #[tokio::test]
    async fn test_release_last_subscriber() {
        let subs = SubscriptionManager::new();
        let (link, _upstream) = link(100);
        let temp = ParsedPath::parse("downstream", "/downstream/a/temp");
        let (a, _rx_a) = client(1);
        let (b, _rx_b) = client(2);

        let stream = subs.subscribe(Some(&link), &a, 1, &temp).await.unwrap();
        subs.subscribe(Some(&link), &b, 1, &temp).await.unwrap();

        stream.remove(&a, 1).await;
        assert!(!subs.release(&stream).await);
        stream.remove(&b, 1).await;
        assert!(subs.release(&stream).await);
        assert!(subs.is_empty().await);
        assert_eq!(subs.lookup(&temp).await, None);
    }

    #[tokio::test]
    async fn test_offline_subscribe_sent_on_connect() {
        let subs = SubscriptionManager::new();
        let (a, mut rx_a) = client(1);
        let (b, _rx_b) = client(2);
        let temp = ParsedPath::parse("downstream", "/downstream/a/temp");

        let stream = subs.subscribe(None, &a, 7, &temp).await.unwrap();
        let again = subs.subscribe(None, &b, 3, &temp).await.unwrap();
        assert!(Arc::ptr_eq(&stream, &again));
        assert!(stream.id() >= PLACEHOLDER_SID_BASE);
        assert_eq!(subs.len().await, 1);

        let (link, _upstream) = link(100);
        let sent = subs.responder_connected(&link).await.unwrap();

        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, "subscribe");
        let upstream_sid = sent[0].paths.as_ref().unwrap()[0].sid;
        assert_eq!(upstream_sid, stream.id());
        assert!(upstream_sid < PLACEHOLDER_SID_BASE);

        subs.dispatch(&ValueUpdate::from_value(&json!([upstream_sid, 1, "ts"])).unwrap())
            .await;
        let got = Envelope::decode(&rx_a.try_recv().unwrap()).unwrap();
        assert_eq!(got.responses[0].updates.as_ref().unwrap()[0], json!([7, 1, "ts"]));
    }

    #[tokio::test]
    async fn test_unknown_sid_dropped() {
        let subs = SubscriptionManager::new();
        let update = ValueUpdate::from_value(&json!([99, 1, "ts"])).unwrap();
        subs.dispatch(&update).await;
        assert!(subs.is_empty().await);
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes_with_cached_value() {
        let subs = SubscriptionManager::new();
        let (first, _upstream) = link(100);
        let temp = ParsedPath::parse("downstream", "/downstream/a/temp");
        let (a, _rx) = client(1);

        let stream = subs.subscribe(Some(&first), &a, 2, &temp).await.unwrap();
        let old_sid = stream.id();
        subs.dispatch(&ValueUpdate::from_value(&json!([old_sid, 7, "ts"])).unwrap())
            .await;

        let (second, _upstream) = link(101);
        second.next_sid();
        let sent = subs.responder_connected(&second).await.unwrap();

        assert_eq!(sent.len(), 1);
        assert_ne!(stream.id(), old_sid);
        assert_eq!(sent[0].paths.as_ref().unwrap()[0].sid, stream.id());
        assert!(subs.get(old_sid).await.is_none());
        assert_eq!(subs.lookup(&temp).await, Some(stream.id()));

        let (late, mut rx_late) = client(2);
        subs.subscribe(Some(&second), &late, 5, &temp).await.unwrap();
        let replay = Envelope::decode(&rx_late.try_recv().unwrap()).unwrap();
        assert_eq!(replay.responses[0].updates.as_ref().unwrap()[0], json!([5, 7, "ts"]));
    }
}
