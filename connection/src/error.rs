//! Connection layer errors.
//!
//! `Display` output is the failure reason reported back to call control.

use crate::state::ConnectionState;
use mgw_rtp::{NegotiationError, SessionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Operation not permitted in the current state
    #[error("cannot {operation} connection in state {state}: {reason}")]
    IllegalState {
        operation: &'static str,
        state: ConnectionState,
        reason: &'static str,
    },

    /// A bind/open hook refused the transition
    #[error("{hook} hook failed: {reason}")]
    Hook { hook: &'static str, reason: String },

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// The connection was closed or rebound while an async operation ran
    #[error("connection {0:x} was closed during the operation")]
    Closed(u32),

    /// Local connection has no joined peer
    #[error("connection {0:x} has no peer")]
    NoPeer(u32),

    /// Only idle connections go back to the pool
    #[error("connection {id:x} is still {state}")]
    InUse { id: u32, state: ConnectionState },
}

impl ConnectionError {
    // ---
    pub(crate) fn hook(hook: &'static str, error: anyhow::Error) -> Self {
        // ---
        ConnectionError::Hook {
            hook,
            reason: format!("{error:#}"),
        }
    }

    /// Whether this is a negotiation failure, including one wrapped by the
    /// media session.
    pub fn is_negotiation(&self) -> bool {
        // ---
        matches!(
            self,
            ConnectionError::Negotiation(_) | ConnectionError::Session(SessionError::Negotiation(_))
        )
    }
}
