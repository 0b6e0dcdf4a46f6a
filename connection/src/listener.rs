//! State change and failure listeners.
//!
//! Listener code runs on the caller's thread after the connection lock is
//! released. Errors and panics raised by a listener are logged and never
//! reach the operation that triggered the dispatch.

use crate::state::ConnectionState;
use std::panic::{self, AssertUnwindSafe};
use tracing::error;

/// A completed state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    // ---
    pub connection: u32,
    pub old: ConnectionState,
    pub new: ConnectionState,
}

/// Observer of every state transition of a connection.
pub trait ConnectionListener: Send + Sync {
    fn state_changed(&self, change: &StateChange) -> anyhow::Result<()>;
}

impl<F> ConnectionListener for F
where
    F: Fn(&StateChange) -> anyhow::Result<()> + Send + Sync,
{
    fn state_changed(&self, change: &StateChange) -> anyhow::Result<()> {
        self(change)
    }
}

/// Told when a connection fails. Nothing else is passed along.
pub trait FailureListener: Send + Sync {
    fn on_failure(&self);
}

impl<F> FailureListener for F
where
    F: Fn() + Send + Sync,
{
    fn on_failure(&self) {
        self()
    }
}

/// Runs `f`, logging an error result or a panic instead of propagating it.
///
/// Returns whether `f` completed successfully.
pub fn dispatch_guarded<F>(what: &str, f: F) -> bool
where
    F: FnOnce() -> anyhow::Result<()>,
{
    // ---
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("{} failed: {:#}", what, e);
            false
        }
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("{} panicked: {}", what, message);
            false
        }
    }
}
