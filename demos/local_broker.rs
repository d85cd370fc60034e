//! In-process broker walkthrough
//!
//! Run with: cargo run --example local_broker
//!
//! A simulated device (responder) and two requesters talk to a broker over
//! in-memory channels instead of sockets:
//!
//! - both requesters list `/downstream/thermo`; the device sees one `list`
//! - both subscribe to `/downstream/thermo/temp`; the device sees one `subscribe`
//! - the device publishes a value; each requester gets it under its own sid
//!
//! # Architecture
//!
//! ```text
//!   requester A ──┐                       ┌── device "thermo"
//!                 ├──►  Broker::serve  ◄──┤
//!   requester B ──┘   (one task each)     └── answers list/subscribe
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;

use dsa_broker::protocol::{Envelope, Request, Response, SubscribePath};
use dsa_broker::{Broker, BrokerConfig, ClientIdentity};

/// Connect a peer and spawn its serve loop; returns its inbound sender and
/// outbound receiver
async fn connect(
    broker: &Arc<Broker>,
    identity: ClientIdentity,
) -> Result<(mpsc::Sender<Bytes>, mpsc::UnboundedReceiver<Bytes>), Box<dyn std::error::Error>> {
    let (client, outbound) = broker.accept(identity)?;
    broker.confirm(&client).await?;

    let (tx, inbound) = mpsc::channel(64);
    let broker = Arc::clone(broker);
    tokio::spawn(async move { broker.serve(client, inbound).await });
    Ok((tx, outbound))
}

async fn send(
    tx: &mpsc::Sender<Bytes>,
    envelope: Envelope,
) -> Result<(), Box<dyn std::error::Error>> {
    tx.send(envelope.encode()?).await?;
    Ok(())
}

/// Print everything a peer has received so far
fn drain(name: &str, rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        println!("{name:>8} <- {}", String::from_utf8_lossy(&frame));
        if let Ok(envelope) = Envelope::decode(&frame) {
            out.push(envelope);
        }
    }
    out
}

fn subscribe(rid: u32, sid: u32) -> Request {
    Request {
        rid,
        method: "subscribe".into(),
        paths: Some(vec![SubscribePath {
            path: "/downstream/thermo/temp".into(),
            sid,
            qos: None,
        }]),
        ..Request::default()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dsa_broker=debug".parse()?),
        )
        .init();

    let broker = Arc::new(Broker::new(BrokerConfig::default()));
    let settle = || tokio::time::sleep(Duration::from_millis(50));

    let (device_tx, mut device_rx) =
        connect(&broker, ClientIdentity::new("thermo-1", "thermo").requester(false)).await?;
    let (a_tx, mut a_rx) =
        connect(&broker, ClientIdentity::new("app-a", "app-a").responder(false)).await?;
    let (b_tx, mut b_rx) =
        connect(&broker, ClientIdentity::new("app-b", "app-b").responder(false)).await?;

    let requests = vec![Request::list(1, "/downstream/thermo"), subscribe(2, 10)];
    send(&a_tx, Envelope::requests(requests)).await?;
    settle().await;

    // Answer whatever the broker asked the device for
    let mut value_sid = None;
    for envelope in drain("device", &mut device_rx) {
        for request in envelope.requests {
            match request.method.as_str() {
                "list" => {
                    let updates = vec![
                        json!(["$is", "node"]),
                        json!(["$name", "Thermostat"]),
                        json!(["temp", {"$is": "node", "$type": "number"}]),
                    ];
                    let response = Response::open(request.rid, updates);
                    send(&device_tx, Envelope::responses(vec![response])).await?;
                }
                "subscribe" => {
                    value_sid = request.paths.and_then(|p| p.first().map(|p| p.sid));
                    let ack = Response::closed(request.rid);
                    send(&device_tx, Envelope::responses(vec![ack])).await?;
                }
                _ => {}
            }
        }
    }
    settle().await;

    // B joins late: snapshot and cached value come from the broker
    let requests = vec![Request::list(7, "/downstream/thermo"), subscribe(8, 40)];
    send(&b_tx, Envelope::requests(requests)).await?;
    settle().await;
    let reissued: usize = drain("device", &mut device_rx)
        .iter()
        .map(|envelope| envelope.requests.len())
        .sum();
    println!("device saw {reissued} new requests");

    if let Some(sid) = value_sid {
        let update = json!([sid, 21.5, "2024-01-01T00:00:00.000Z"]);
        send(&device_tx, Envelope::responses(vec![Response::values(vec![update])])).await?;
    }
    settle().await;

    drain("app-a", &mut a_rx);
    drain("app-b", &mut b_rx);
    Ok(())
}
