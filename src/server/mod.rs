//! Broker server
//!
//! [`Broker`] is the entry point: it owns the client lifecycle, the
//! responders of every downstream link and the broker's own node tree.

pub mod broker;
pub mod config;
pub mod manager;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use manager::ClientManager;
