//! Client lifecycle
//!
//! Authenticated clients start out pending with an eviction timer armed.
//! Confirming the handshake cancels the timer and makes the client the one
//! connected client for its `ds_id`; any older connection with the same
//! identity is handed back to the caller to be torn down.
//!
//! Confirm and eviction both take the pending lock first, so exactly one of
//! them acts on a given client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::session::{Client, ClientPhase};

struct PendingClient {
    client: Arc<Client>,
    timer: JoinHandle<()>,
}

/// Pending and connected clients
pub struct ClientManager {
    pending_timeout: Duration,
    pending: Mutex<HashMap<u64, PendingClient>>,
    connected: Mutex<HashMap<String, Arc<Client>>>,
}

impl ClientManager {
    pub fn new(pending_timeout: Duration) -> Self {
        Self {
            pending_timeout,
            pending: Mutex::new(HashMap::new()),
            connected: Mutex::new(HashMap::new()),
        }
    }

    /// Register `client` as pending and arm its eviction timer
    pub fn add_pending(self: &Arc<Self>, client: Arc<Client>) {
        let manager = Arc::downgrade(self);
        let session_id = client.session_id();
        let timeout = self.pending_timeout;

        let mut pending = self.pending.lock();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = manager.upgrade() {
                manager.evict(session_id);
            }
        });

        tracing::debug!(
            session_id = session_id,
            ds_id = %client.ds_id(),
            timeout_ms = timeout.as_millis() as u64,
            "Client pending"
        );
        pending.insert(session_id, PendingClient { client, timer });
    }

    /// Evict a client that is still pending
    ///
    /// Returns the evicted client; `None` if it was confirmed or removed
    /// in the meantime.
    pub fn evict(&self, session_id: u64) -> Option<Arc<Client>> {
        let entry = self.pending.lock().remove(&session_id)?;
        entry.timer.abort();
        entry.client.close();

        tracing::info!(
            session_id = session_id,
            ds_id = %entry.client.ds_id(),
            "Pending client evicted"
        );
        Some(entry.client)
    }

    /// Move a pending client to connected
    ///
    /// Returns the connection this one supersedes, if any.
    pub fn confirm(&self, client: &Arc<Client>) -> Result<Option<Arc<Client>>> {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.remove(&client.session_id()) else {
            return Err(Error::NotPending(client.ds_id().to_string()));
        };
        entry.timer.abort();

        if !client.set_phase(ClientPhase::Connected) {
            return Err(Error::NotPending(client.ds_id().to_string()));
        }

        let previous = self
            .connected
            .lock()
            .insert(client.ds_id().to_string(), Arc::clone(client));
        drop(pending);

        Ok(previous.filter(|prev| !Arc::ptr_eq(prev, client)))
    }

    /// Forget `client` wherever it is registered
    pub fn remove(&self, client: &Client) -> bool {
        let mut removed = false;
        {
            let mut pending = self.pending.lock();
            if let Some(entry) = pending.remove(&client.session_id()) {
                entry.timer.abort();
                removed = true;
            }
        }

        let mut connected = self.connected.lock();
        if connected
            .get(client.ds_id())
            .is_some_and(|current| current.session_id() == client.session_id())
        {
            connected.remove(client.ds_id());
            removed = true;
        }
        removed
    }

    /// The connected client for `ds_id`
    pub fn get(&self, ds_id: &str) -> Option<Arc<Client>> {
        self.connected.lock().get(ds_id).cloned()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.lock().len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager")
            .field("pending_timeout", &self.pending_timeout)
            .field("pending", &self.pending_count())
            .field("connected", &self.connected_count())
            .finish()
    }
}
