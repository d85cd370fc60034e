//! Broker facade
//!
//! Wires clients, responders and the local tree together. The transport
//! authenticates a peer, calls [`Broker::accept`], completes the handshake,
//! calls [`Broker::confirm`] and then hands inbound frames to
//! [`Broker::serve`] while draining the client's outbound receiver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock, Semaphore};

use super::config::BrokerConfig;
use super::manager::ClientManager;
use crate::error::{Error, Result};
use crate::node::{MemoryTree, NodeTree, ParsedPath};
use crate::protocol::{Envelope, Response};
use crate::session::{Client, ClientIdentity, ClientPhase, Responder, ResponderLink};

/// Broker
pub struct Broker {
    config: BrokerConfig,
    tree: Arc<dyn NodeTree>,
    clients: Arc<ClientManager>,
    responders: RwLock<HashMap<String, Arc<Responder>>>,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl Broker {
    /// Create a broker serving a default local tree
    pub fn new(config: BrokerConfig) -> Self {
        let tree = MemoryTree::new(config.downstream_name.clone());
        tree.insert("/")
            .set_attribute("$name", config.broker_name.clone().into());
        tree.insert("/sys");
        tree.insert(&format!("/{}", config.downstream_name));
        Self::with_tree(config, Arc::new(tree))
    }

    /// Create a broker serving `tree` as its local nodes
    pub fn with_tree(config: BrokerConfig, tree: Arc<dyn NodeTree>) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            clients: Arc::new(ClientManager::new(config.pending_timeout)),
            config,
            tree,
            responders: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn clients(&self) -> &Arc<ClientManager> {
        &self.clients
    }

    pub fn parse_path(&self, raw: &str) -> ParsedPath {
        ParsedPath::parse(&self.config.downstream_name, raw)
    }

    /// The responder for link `name`, connected or not
    pub async fn responder(&self, name: &str) -> Option<Arc<Responder>> {
        self.responders.read().await.get(name).cloned()
    }

    async fn responder_or_insert(&self, name: &str) -> Arc<Responder> {
        if let Some(responder) = self.responder(name).await {
            return responder;
        }
        let mut responders = self.responders.write().await;
        Arc::clone(
            responders
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Responder::new(name))),
        )
    }

    /// Register an authenticated peer as pending
    ///
    /// Returns the client and the receiver the transport drains for
    /// outbound frames. The client holds its connection slot until it
    /// closes, whether by disconnect, supersession or pending eviction.
    pub fn accept(
        &self,
        identity: ClientIdentity,
    ) -> Result<(Arc<Client>, mpsc::UnboundedReceiver<Bytes>)> {
        let permit = match &self.connection_semaphore {
            Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(ds_id = %identity.ds_id, "Connection rejected: limit reached");
                    return Err(Error::ConnectionLimit(self.config.max_connections));
                }
            },
            None => None,
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (client, rx) = Client::new(session_id, identity);
        if let Some(permit) = permit {
            client.hold_permit(permit);
        }
        self.clients.add_pending(Arc::clone(&client));

        tracing::debug!(
            session_id = session_id,
            ds_id = %client.ds_id(),
            "New connection"
        );
        Ok((client, rx))
    }

    /// Complete the handshake for a pending client
    ///
    /// Tears down an older connection with the same identity and, for
    /// responders, attaches the connection as the link's live upstream.
    pub async fn confirm(&self, client: &Arc<Client>) -> Result<()> {
        if let Some(previous) = self.clients.confirm(client)? {
            tracing::info!(
                ds_id = %client.ds_id(),
                old_session = previous.session_id(),
                new_session = client.session_id(),
                "Connection superseded"
            );
            self.teardown(&previous).await;
        }

        if client.identity().responder {
            let responder = self.responder_or_insert(&client.identity().name).await;
            let link = Arc::new(ResponderLink::new(client.writer().clone()));
            responder.connect(link).await?;
        }

        tracing::info!(
            session_id = client.session_id(),
            ds_id = %client.ds_id(),
            link = %client.identity().name,
            "Client connected"
        );
        Ok(())
    }

    /// Route one inbound envelope from `client`
    pub async fn handle_message(&self, client: &Arc<Client>, frame: &[u8]) -> Result<()> {
        if client.phase() != ClientPhase::Connected {
            return Err(Error::NotConnected(client.ds_id().to_string()));
        }
        let envelope = Envelope::decode(frame)?;

        if !envelope.requests.is_empty() {
            if client.identity().requester {
                let mut replies = Vec::new();
                for request in envelope.requests {
                    if let Some(reply) = client.requester().handle(client, self, request).await {
                        replies.push(reply);
                    }
                }
                if !replies.is_empty() {
                    client.writer().send_responses(replies)?;
                }
            } else {
                tracing::warn!(
                    session_id = client.session_id(),
                    count = envelope.requests.len(),
                    "Requests from non-requester dropped"
                );
            }
        }

        if !envelope.responses.is_empty() {
            self.route_responses(client, envelope.responses).await;
        }
        Ok(())
    }

    async fn route_responses(&self, client: &Client, responses: Vec<Response>) {
        let responder = match self.responder(&client.identity().name).await {
            Some(responder) if client.identity().responder => responder,
            _ => {
                tracing::warn!(session_id = client.session_id(), "Responses from non-responder dropped");
                return;
            }
        };

        let live = responder
            .link()
            .await
            .is_some_and(|link| link.session_id() == client.session_id());
        if !live {
            tracing::debug!(session_id = client.session_id(), "Responses from stale link dropped");
            return;
        }

        for response in responses {
            responder.handle_response(response).await;
        }
    }

    /// Unwind everything `client` holds and close it
    pub async fn disconnect(&self, client: &Arc<Client>) {
        self.clients.remove(client);
        self.teardown(client).await;
        tracing::info!(
            session_id = client.session_id(),
            ds_id = %client.ds_id(),
            "Client disconnected"
        );
    }

    async fn teardown(&self, client: &Arc<Client>) {
        client.requester().detach_all(client).await;
        if client.identity().responder {
            if let Some(responder) = self.responder(&client.identity().name).await {
                responder.disconnect(client.session_id()).await;
            }
        }
        client.close();
    }

    /// Drive one connection until the peer goes away or the broker closes it
    pub async fn serve(&self, client: Arc<Client>, mut inbound: mpsc::Receiver<Bytes>) {
        loop {
            tokio::select! {
                _ = client.closed() => break,
                frame = inbound.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = self.handle_message(&client, &frame).await {
                        tracing::warn!(
                            session_id = client.session_id(),
                            error = %e,
                            "Failed to handle message"
                        );
                    }
                }
            }
        }

        self.disconnect(&client).await;
    }

    /// Snapshot of a node in the broker's own tree
    pub fn list_local(&self, rid: u32, path: &ParsedPath) -> Result<Response> {
        match self.tree.resolve(path) {
            Some(node) if node.accessible() => Ok(Response::open(rid, node.list())),
            _ => Err(Error::PathNotFound(path.full().to_string())),
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("config", &self.config)
            .field("clients", &self.clients)
            .finish()
    }
}
