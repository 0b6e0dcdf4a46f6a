//! The endpoint seam.
//!
//! Endpoints own the mixing graph and the connection registry; connections
//! only hold a weak reference back to theirs.

use crate::connection::ConnectionType;
use mgw_common::ConnectionMode;

/// What a connection needs from the endpoint it belongs to.
pub trait Endpoint: Send + Sync {
    /// Local name, used in logs.
    fn name(&self) -> &str;

    /// A connection changed mode; the endpoint rebalances its mixer.
    fn mode_updated(&self, old: ConnectionMode, new: ConnectionMode);

    /// A connection went back to `NULL` and no longer belongs here.
    fn release_connection(&self, id: u32, kind: ConnectionType);
}
