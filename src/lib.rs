//! Node-tree broker
//!
//! Routes `list`, `subscribe`, `invoke`, `set`, `remove` and `close` calls
//! from requesters to the responders mounted under the broker's downstream
//! node, and multiplexes any number of requesters onto one upstream request
//! per path.
//!
//! # Example
//!
//! ```no_run
//! use dsa_broker::{Broker, BrokerConfig, ClientIdentity};
//!
//! # async fn run() -> dsa_broker::Result<()> {
//! let broker = Broker::new(BrokerConfig::default());
//!
//! let (client, mut outbound) = broker.accept(ClientIdentity::new("dev-1", "dev"))?;
//! broker.confirm(&client).await?;
//!
//! while let Some(frame) = outbound.recv().await {
//!     // write `frame` to the peer's socket
//! #   let _ = frame;
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod node;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stream;

pub use error::{Error, Result};
pub use node::{MemoryTree, NodeHandle, NodeTree, ParsedPath};
pub use protocol::{Envelope, Request, Response};
pub use server::{Broker, BrokerConfig};
pub use session::{Client, ClientIdentity};
pub use stream::{Stream, StreamKind, StreamPhase};
