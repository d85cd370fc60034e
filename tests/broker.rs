//! End-to-end routing through a broker with in-memory connections

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

use dsa_broker::protocol::{Envelope, Request, Response, StreamStatus, SubscribePath};
use dsa_broker::session::ClientPhase;
use dsa_broker::{Broker, BrokerConfig, Client, ClientIdentity};

struct Peer {
    client: Arc<Client>,
    rx: UnboundedReceiver<Bytes>,
}

impl Peer {
    async fn connect(broker: &Broker, identity: ClientIdentity) -> Self {
        let (client, rx) = broker.accept(identity).unwrap();
        broker.confirm(&client).await.unwrap();
        Self { client, rx }
    }

    async fn send(&self, broker: &Broker, envelope: Envelope) {
        let frame = envelope.encode().unwrap();
        broker.handle_message(&self.client, &frame).await.unwrap();
    }

    async fn request(&self, broker: &Broker, request: Request) {
        self.send(broker, Envelope::requests(vec![request])).await;
    }

    async fn respond(&self, broker: &Broker, response: Response) {
        self.send(broker, Envelope::responses(vec![response])).await;
    }

    fn envelopes(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            out.push(Envelope::decode(&frame).unwrap());
        }
        out
    }

    fn requests(&mut self) -> Vec<Request> {
        self.envelopes().into_iter().flat_map(|e| e.requests).collect()
    }

    fn responses(&mut self) -> Vec<Response> {
        self.envelopes().into_iter().flat_map(|e| e.responses).collect()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn requester(ds_id: &str) -> ClientIdentity {
    ClientIdentity::new(ds_id, ds_id).responder(false)
}

fn responder(ds_id: &str, link: &str) -> ClientIdentity {
    ClientIdentity::new(ds_id, link).requester(false)
}

fn invoke(rid: u32, path: &str) -> Request {
    Request {
        rid,
        method: "invoke".into(),
        path: Some(path.into()),
        params: Some(json!({"delay": 1})),
        ..Request::default()
    }
}

fn update_names(response: &Response) -> Vec<Value> {
    response
        .updates
        .iter()
        .flatten()
        .map(|u| u[0].clone())
        .collect()
}

#[tokio::test]
async fn test_list_dedup_and_snapshot() {
    init_tracing();
    let broker = Broker::new(BrokerConfig::default());
    let mut dev = Peer::connect(&broker, responder("dev-1", "dev")).await;
    let mut a = Peer::connect(&broker, requester("a")).await;
    let mut b = Peer::connect(&broker, requester("b")).await;

    a.request(&broker, Request::list(3, "/downstream/dev/foo")).await;
    let upstream = dev.requests();
    assert_eq!(upstream.len(), 1);
    assert_eq!(upstream[0].path.as_deref(), Some("/foo"));
    let rid = upstream[0].rid;

    dev.respond(
        &broker,
        Response::open(
            rid,
            vec![json!(["$is", "node"]), json!(["x", 1]), json!(["y", 2])],
        ),
    )
    .await;
    let first = a.responses();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].rid, 3);

    b.request(&broker, Request::list(11, "/downstream/dev/foo/")).await;
    assert!(dev.requests().is_empty());

    let envelopes = b.envelopes();
    assert_eq!(envelopes.len(), 1);
    let snapshot = &envelopes[0].responses[0];
    assert_eq!(snapshot.rid, 11);
    assert_eq!(snapshot.updates.as_ref().unwrap().len(), 3);
    assert_eq!(update_names(snapshot)[0], json!("$is"));

    // Live updates reach both under their own rids
    dev.respond(&broker, Response::open(rid, vec![json!(["z", 3])])).await;
    assert_eq!(a.responses()[0].rid, 3);
    assert_eq!(b.responses()[0].rid, 11);

    // Upstream close only once the last requester leaves
    a.request(&broker, Request::close(3)).await;
    assert!(dev.requests().is_empty());
    b.request(&broker, Request::close(11)).await;
    let closes = dev.requests();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].method, "close");
    assert_eq!(closes[0].rid, rid);

    // Interest returns: a fresh upstream list
    a.request(&broker, Request::list(4, "/downstream/dev/foo")).await;
    let again = dev.requests();
    assert_eq!(again.len(), 1);
    assert_ne!(again[0].rid, rid);
}

#[tokio::test]
async fn test_invoke_lifecycle() {
    let broker = Broker::new(BrokerConfig::default());
    let mut dev = Peer::connect(&broker, responder("dev-1", "dev")).await;
    let mut a = Peer::connect(&broker, requester("a")).await;

    a.request(&broker, invoke(8, "/downstream/dev/reboot")).await;
    let forwarded = dev.requests();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].method, "invoke");
    assert_eq!(forwarded[0].path.as_deref(), Some("/reboot"));
    assert_eq!(forwarded[0].params, Some(json!({"delay": 1})));
    let rid = forwarded[0].rid;

    dev.respond(
        &broker,
        Response {
            rid,
            stream: Some(StreamStatus::Open),
            updates: Some(vec![json!(["rebooting"])]),
            ..Response::default()
        },
    )
    .await;
    dev.respond(&broker, Response::closed(rid)).await;

    let relayed = a.responses();
    assert_eq!(relayed.len(), 2);
    assert!(relayed.iter().all(|r| r.rid == 8));
    assert_eq!(relayed[0].stream, Some(StreamStatus::Open));
    assert!(relayed[1].is_closed());
    assert_eq!(a.client.requester().open_requests(), 0);

    // Repeat close is a no-op upstream
    a.request(&broker, Request::close(8)).await;
    assert!(dev.requests().is_empty());

    // A response for the finished rid is dropped
    dev.respond(&broker, Response::open(rid, vec![json!([1])])).await;
    assert!(a.responses().is_empty());
}

#[tokio::test]
async fn test_invoke_closed_on_responder_disconnect() {
    let broker = Broker::new(BrokerConfig::default());
    let dev = Peer::connect(&broker, responder("dev-1", "dev")).await;
    let mut a = Peer::connect(&broker, requester("a")).await;

    a.request(&broker, invoke(5, "/downstream/dev/long")).await;
    broker.disconnect(&dev.client).await;

    let closed = a.responses();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].rid, 5);
    assert!(closed[0].is_closed());

    // Offline link: invoke fails on the request itself
    a.request(&broker, invoke(6, "/downstream/dev/long")).await;
    let err = a.responses();
    assert_eq!(err[0].rid, 6);
    assert_eq!(err[0].error.as_ref().unwrap().msg, "Disconnected");
}

#[tokio::test]
async fn test_subscribe_dedup_and_value_fanout() {
    let broker = Broker::new(BrokerConfig::default());
    let mut dev = Peer::connect(&broker, responder("dev-1", "dev")).await;
    let mut a = Peer::connect(&broker, requester("a")).await;
    let mut b = Peer::connect(&broker, requester("b")).await;

    let subscribe = |rid, sid| Request {
        rid,
        method: "subscribe".into(),
        paths: Some(vec![SubscribePath {
            path: "/downstream/dev/temp".into(),
            sid,
            qos: Some(0),
        }]),
        ..Request::default()
    };

    a.request(&broker, subscribe(1, 10)).await;
    let upstream = dev.requests();
    assert_eq!(upstream.len(), 1);
    let sid = upstream[0].paths.as_ref().unwrap()[0].sid;
    dev.respond(&broker, Response::closed(upstream[0].rid)).await;

    dev.respond(&broker, Response::values(vec![json!([sid, 20.5, "2024-01-01T00:00:00Z"])]))
        .await;

    b.request(&broker, subscribe(1, 99)).await;
    assert!(dev.requests().is_empty());

    let a_got = a.responses();
    assert!(a_got[0].is_closed());
    assert_eq!(a_got[1].updates.as_ref().unwrap()[0], json!([10, 20.5, "2024-01-01T00:00:00Z"]));

    let b_got = b.responses();
    // Cached value replayed, then the ack
    assert_eq!(b_got[0].rid, 0);
    assert_eq!(b_got[0].updates.as_ref().unwrap()[0], json!([99, 20.5, "2024-01-01T00:00:00Z"]));
    assert!(b_got[1].is_closed());
}

#[tokio::test]
async fn test_responder_reconnect_reissues_once() {
    let broker = Broker::new(BrokerConfig::default());
    let mut dev = Peer::connect(&broker, responder("dev-1", "dev")).await;
    let mut a = Peer::connect(&broker, requester("a")).await;

    a.request(&broker, Request::list(1, "/downstream/dev")).await;
    a.request(&broker, Request::list(2, "/downstream/dev/foo")).await;
    let first = dev.requests();
    assert_eq!(first.len(), 2);
    dev.respond(&broker, Response::open(first[1].rid, vec![json!(["x", 1])])).await;
    a.responses();

    broker.disconnect(&dev.client).await;
    let marker = a.responses();
    assert_eq!(marker.len(), 1);
    assert_eq!(marker[0].rid, 1);
    assert_eq!(update_names(&marker[0]), vec![json!("$disconnectedTs")]);

    // The cache survives while the link is down
    let mut c = Peer::connect(&broker, requester("c")).await;
    c.request(&broker, Request::list(7, "/downstream/dev/foo")).await;
    assert_eq!(c.responses()[0].updates.as_ref().unwrap()[0], json!(["x", 1]));

    let mut dev = Peer::connect(&broker, responder("dev-1", "dev")).await;
    let reissued = dev.requests();
    assert_eq!(reissued.len(), 2);
    let mut paths: Vec<_> = reissued.iter().filter_map(|r| r.path.clone()).collect();
    paths.sort();
    assert_eq!(paths, vec!["/".to_string(), "/foo".to_string()]);

    // Responses on the new rids reach the old requesters
    let foo = reissued.iter().find(|r| r.path.as_deref() == Some("/foo")).unwrap();
    dev.respond(&broker, Response::open(foo.rid, vec![json!(["x", 2])])).await;
    assert_eq!(a.responses()[0].rid, 2);
    assert_eq!(c.responses()[0].rid, 7);
}

#[tokio::test]
async fn test_offline_link_root() {
    let broker = Broker::new(BrokerConfig::default());
    let dev = Peer::connect(&broker, responder("dev-1", "dev")).await;
    broker.disconnect(&dev.client).await;
    let mut a = Peer::connect(&broker, requester("a")).await;

    a.request(&broker, Request::list(1, "/downstream/dev")).await;
    let got = a.responses();
    assert_eq!(got.len(), 1);
    assert_eq!(
        update_names(&got[0]),
        vec![json!("$is"), json!("$disconnectedTs")]
    );

    a.request(&broker, Request::list(2, "/downstream/dev/deep")).await;
    assert!(a.responses().is_empty());
}

#[tokio::test]
async fn test_supersession_closes_older_connection() {
    let broker = Broker::new(BrokerConfig::default());
    let mut dev = Peer::connect(&broker, responder("dev-1", "dev")).await;
    let a = Peer::connect(&broker, requester("a")).await;
    a.request(&broker, Request::list(1, "/downstream/dev/foo")).await;
    dev.requests();

    let newer = Peer::connect(&broker, requester("a")).await;
    assert!(a.client.is_closed());
    assert_eq!(newer.client.phase(), ClientPhase::Connected);
    assert_eq!(broker.clients().connected_count(), 2);

    // The superseded requester's list was the only interest
    let closes = dev.requests();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].method, "close");
}

#[tokio::test(start_paused = true)]
async fn test_pending_client_evicted() {
    let broker = Broker::new(BrokerConfig::default().pending_timeout(Duration::from_secs(30)));
    let (client, _rx) = broker.accept(requester("slow")).unwrap();

    tokio::time::sleep(Duration::from_secs(31)).await;

    assert!(client.is_closed());
    assert_eq!(broker.clients().pending_count(), 0);
    assert!(broker.confirm(&client).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_confirm_wins_over_timer() {
    let broker = Broker::new(BrokerConfig::default().pending_timeout(Duration::from_secs(30)));
    let (client, _rx) = broker.accept(requester("quick")).unwrap();

    tokio::time::sleep(Duration::from_secs(29)).await;
    broker.confirm(&client).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(client.phase(), ClientPhase::Connected);
    assert_eq!(broker.clients().connected_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_evicted_handshake_frees_connection_slot() {
    let config = BrokerConfig::default()
        .pending_timeout(Duration::from_secs(30))
        .max_connections(1);
    let broker = Broker::new(config);
    let (stalled, _rx) = broker.accept(requester("stalled")).unwrap();

    tokio::time::sleep(Duration::from_secs(31)).await;

    assert!(stalled.is_closed());
    assert_eq!(broker.clients().pending_count(), 0);
    let next = Peer::connect(&broker, requester("next")).await;
    assert_eq!(next.client.phase(), ClientPhase::Connected);
}

#[tokio::test]
async fn test_same_client_two_rids_on_one_path() {
    let broker = Broker::new(BrokerConfig::default());
    let mut dev = Peer::connect(&broker, responder("dev-1", "dev")).await;
    let mut a = Peer::connect(&broker, requester("a")).await;

    a.request(&broker, Request::list(1, "/downstream/dev/foo")).await;
    a.request(&broker, Request::list(2, "/downstream/dev/foo")).await;
    let upstream = dev.requests();
    assert_eq!(upstream.len(), 1);
    let rid = upstream[0].rid;

    dev.respond(&broker, Response::open(rid, vec![json!(["x", 1])])).await;
    let mut rids: Vec<u32> = a.responses().iter().map(|r| r.rid).collect();
    rids.sort();
    assert_eq!(rids, vec![1, 2]);

    // Closing one rid leaves the other attached and the stream open
    a.request(&broker, Request::close(1)).await;
    assert!(dev.requests().is_empty());

    dev.respond(&broker, Response::open(rid, vec![json!(["x", 2])])).await;
    let rids: Vec<u32> = a.responses().iter().map(|r| r.rid).collect();
    assert_eq!(rids, vec![2]);

    a.request(&broker, Request::close(2)).await;
    let closes = dev.requests();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].method, "close");
}

#[tokio::test]
async fn test_subscribe_while_offline_issued_on_reconnect() {
    let broker = Broker::new(BrokerConfig::default());
    let dev = Peer::connect(&broker, responder("dev-1", "dev")).await;
    broker.disconnect(&dev.client).await;
    let mut a = Peer::connect(&broker, requester("a")).await;

    let subscribe = Request {
        rid: 3,
        method: "subscribe".into(),
        paths: Some(vec![SubscribePath {
            path: "/downstream/dev/temp".into(),
            sid: 7,
            qos: None,
        }]),
        ..Request::default()
    };
    a.request(&broker, subscribe).await;
    let ack = a.responses();
    assert_eq!(ack.len(), 1);
    assert!(ack[0].is_closed());
    assert!(ack[0].error.is_none());
    assert_eq!(a.client.requester().open_subscriptions(), 1);

    let mut dev = Peer::connect(&broker, responder("dev-1", "dev")).await;
    let upstream = dev.requests();
    assert_eq!(upstream.len(), 1);
    assert_eq!(upstream[0].method, "subscribe");
    let sid = upstream[0].paths.as_ref().unwrap()[0].sid;

    dev.respond(&broker, Response::values(vec![json!([sid, 19.5, "ts"])]))
        .await;
    let values = a.responses();
    assert_eq!(values[0].rid, 0);
    assert_eq!(values[0].updates.as_ref().unwrap()[0], json!([7, 19.5, "ts"]));
}
