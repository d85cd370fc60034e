//! Authenticated client connections
//!
//! A `Client` is what the broker knows about one physical connection: the
//! identity produced by the handshake, the outbound sink, the requester-side
//! bookkeeping and the lifecycle phase. The transport owns the other end of
//! the outbound channel and the inbound message stream.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit};

use super::requester::Requester;
use crate::error::{Error, Result};
use crate::protocol::{Envelope, Request, Response};

/// Identity established by the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Stable identity string; at most one live connection per value
    pub ds_id: String,
    /// Link name the client's tree is mounted under
    pub name: String,
    /// Client issues requests
    pub requester: bool,
    /// Client exposes a node tree
    pub responder: bool,
}

impl ClientIdentity {
    /// Identity with both roles enabled
    pub fn new(ds_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            ds_id: ds_id.into(),
            name: name.into(),
            requester: true,
            responder: true,
        }
    }

    pub fn requester(mut self, enabled: bool) -> Self {
        self.requester = enabled;
        self
    }

    pub fn responder(mut self, enabled: bool) -> Self {
        self.responder = enabled;
        self
    }
}

/// Connection lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// Authenticated, handshake not yet confirmed
    Pending,
    /// Handshake confirmed, traffic accepted
    Connected,
    /// Closed or evicted
    Closed,
}

/// Outbound sink for one connection
///
/// Writes enqueue serialized envelopes; the transport task drains the
/// receiver and performs the actual I/O.
#[derive(Debug, Clone)]
pub struct Writer {
    session_id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl Writer {
    /// Create a writer and the receiver the transport drains
    pub fn channel(session_id: u64) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { session_id, tx }, rx)
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Enqueue one serialized frame
    pub fn write(&self, frame: Bytes) -> Result<()> {
        self.tx.send(frame).map_err(|_| Error::ConnectionClosed)
    }

    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        self.write(envelope.encode()?)
    }

    pub fn send_responses(&self, responses: Vec<Response>) -> Result<()> {
        self.send(&Envelope::responses(responses))
    }

    pub fn send_requests(&self, requests: Vec<Request>) -> Result<()> {
        self.send(&Envelope::requests(requests))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One authenticated connection
pub struct Client {
    session_id: u64,
    identity: ClientIdentity,
    writer: Writer,
    requester: Requester,
    phase: Mutex<ClientPhase>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    closed: Notify,
}

impl Client {
    /// Create a pending client and the receiver for its outbound frames
    pub fn new(
        session_id: u64,
        identity: ClientIdentity,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (writer, rx) = Writer::channel(session_id);
        let client = Arc::new(Self {
            session_id,
            identity,
            writer,
            requester: Requester::new(),
            phase: Mutex::new(ClientPhase::Pending),
            permit: Mutex::new(None),
            closed: Notify::new(),
        });
        (client, rx)
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn ds_id(&self) -> &str {
        &self.identity.ds_id
    }

    pub fn writer(&self) -> &Writer {
        &self.writer
    }

    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    pub fn phase(&self) -> ClientPhase {
        *self.phase.lock()
    }

    /// Move to `phase`; a closed client never reopens
    pub(crate) fn set_phase(&self, phase: ClientPhase) -> bool {
        let mut current = self.phase.lock();
        if *current == ClientPhase::Closed {
            return false;
        }
        *current = phase;
        true
    }

    /// Hold a connection-limit slot until the client closes
    pub(crate) fn hold_permit(&self, permit: OwnedSemaphorePermit) {
        *self.permit.lock() = Some(permit);
    }

    /// Mark the connection closed, give back its connection slot and wake
    /// anyone waiting in [`Client::closed`]
    pub fn close(&self) {
        *self.phase.lock() = ClientPhase::Closed;
        self.permit.lock().take();
        self.closed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == ClientPhase::Closed
    }

    /// Resolve once the broker has closed this connection
    pub async fn closed(&self) {
        let notified = self.closed.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session_id", &self.session_id)
            .field("identity", &self.identity)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_writer_frames() {
        let (client, mut rx) = Client::new(1, ClientIdentity::new("a-1", "a"));

        client
            .writer()
            .send_responses(vec![Response::closed(2)])
            .unwrap();

        let frame = rx.recv().await.unwrap();
        let env = Envelope::decode(&frame).unwrap();
        assert_eq!(env.responses, vec![Response::closed(2)]);
    }

    #[tokio::test]
    async fn test_writer_after_receiver_dropped() {
        let (client, rx) = Client::new(1, ClientIdentity::new("a-1", "a"));
        drop(rx);

        assert!(client.writer().is_closed());
        assert!(matches!(
            client.writer().send_requests(vec![Request::close(1)]),
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_phase_transitions() {
        let (client, _rx) = Client::new(1, ClientIdentity::new("a-1", "a"));
        assert_eq!(client.phase(), ClientPhase::Pending);

        assert!(client.set_phase(ClientPhase::Connected));
        assert_eq!(client.phase(), ClientPhase::Connected);

        client.close();
        assert!(!client.set_phase(ClientPhase::Connected));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_closed_wakes_waiter() {
        let (client, _rx) = Client::new(1, ClientIdentity::new("a-1", "a"));

        let waiter = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.closed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.close();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        // Already closed: returns immediately
        client.closed().await;
    }

    #[tokio::test]
    async fn test_close_releases_permit() {
        let slots = Arc::new(tokio::sync::Semaphore::new(1));
        let (client, _rx) = Client::new(1, ClientIdentity::new("a-1", "a"));
        client.hold_permit(Arc::clone(&slots).try_acquire_owned().unwrap());
        assert_eq!(slots.available_permits(), 0);

        client.close();
        assert_eq!(slots.available_permits(), 1);
    }

    #[test]
    fn test_identity_roles() {
        let id = ClientIdentity::new("x-1", "x").responder(false);
        assert!(id.requester);
        assert!(!id.responder);
    }
}
