//! Broker configuration

use std::time::Duration;

use crate::protocol::constants::*;

/// Broker configuration options
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Name of the node responder links are mounted under
    pub downstream_name: String,

    /// Name the broker reports for itself
    pub broker_name: String,

    /// How long an authenticated client may stay pending
    pub pending_timeout: Duration,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            downstream_name: DEFAULT_DOWNSTREAM_NAME.to_string(),
            broker_name: DEFAULT_BROKER_NAME.to_string(),
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            max_connections: 0, // Unlimited
        }
    }
}

impl BrokerConfig {
    /// Set the downstream node name
    pub fn downstream_name(mut self, name: impl Into<String>) -> Self {
        self.downstream_name = name.into();
        self
    }

    /// Set the broker name
    pub fn broker_name(mut self, name: impl Into<String>) -> Self {
        self.broker_name = name.into();
        self
    }

    /// Set the pending timeout
    pub fn pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}
