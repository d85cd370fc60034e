//! Protocol constants

use std::time::Duration;

/// Response rid reserved for the aggregated value-subscription feed
pub const VALUE_UPDATE_RID: u32 = 0;

/// List entry marking a type/identity change; resets the list cache
pub const IS_ATTRIBUTE: &str = "$is";

/// List entry carrying the time a link went offline
pub const DISCONNECTED_TS_ATTRIBUTE: &str = "$disconnectedTs";

/// Default `$is` profile for synthesized nodes
pub const NODE_PROFILE: &str = "node";

/// `change` value of a list entry that removes a child
pub const CHANGE_REMOVE: &str = "remove";

/// Name of the broker node under which responder links are mounted
pub const DEFAULT_DOWNSTREAM_NAME: &str = "downstream";

/// Default broker name reported to peers
pub const DEFAULT_BROKER_NAME: &str = "broker";

/// How long a pending connection may take to complete its handshake
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(30);
