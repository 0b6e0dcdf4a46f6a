//! Local connections: in-process legs joining two endpoints.
//!
//! Two local connections are joined pairwise and exchange frames through
//! each other's inbox. Closing one side unlinks the pair; the other side
//! stays open until its own owner closes it or its heartbeat expires.

use crate::connection::{Connection, ConnectionKind, ConnectionType};
use crate::error::ConnectionError;
use mgw_common::ConnectionMode;
use mgw_rtp::Frame;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Frames held for a reader that does not keep up. Oldest go first.
pub const INBOX_CAPACITY: usize = 64;

/// Link state of a local connection.
#[derive(Default)]
pub struct LocalLink {
    // ---
    peer: Mutex<Option<Weak<LocalConnection>>>,
    inbox: Mutex<VecDeque<Frame>>,
}

/// A connection to another endpoint in the same gateway.
pub type LocalConnection = Connection<LocalLink>;

impl LocalLink {
    // ---
    pub fn peer(&self) -> Option<Arc<LocalConnection>> {
        // ---
        self.peer.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn is_linked(&self) -> bool {
        // ---
        self.peer().is_some()
    }

    /// Frames waiting to be read.
    pub fn queued(&self) -> usize {
        // ---
        self.inbox.lock().len()
    }

    fn deliver(&self, frame: Frame) {
        // ---
        let mut inbox = self.inbox.lock();
        if inbox.len() >= INBOX_CAPACITY {
            inbox.pop_front();
            trace!("Local inbox full, dropped oldest frame");
        }
        inbox.push_back(frame);
    }

    fn unlink(&self) {
        // ---
        let Some(peer) = self.peer.lock().take().and_then(|p| p.upgrade()) else {
            return;
        };
        *peer.kind().peer.lock() = None;
        debug!("Local connection {:x} unlinked", peer.id());
    }
}

impl ConnectionKind for LocalLink {
    const TYPE: ConnectionType = ConnectionType::Local;

    fn on_created(&self) -> anyhow::Result<()> {
        // ---
        *self.peer.lock() = None;
        self.inbox.lock().clear();
        Ok(())
    }

    fn on_closed(&self) -> anyhow::Result<()> {
        // ---
        self.unlink();
        self.inbox.lock().clear();
        Ok(())
    }

    fn on_failed(&self) -> anyhow::Result<()> {
        // ---
        self.on_closed()
    }

    fn apply_mode(&self, mode: ConnectionMode) -> anyhow::Result<()> {
        // ---
        if !mode.receives() {
            self.inbox.lock().clear();
        }
        Ok(())
    }
}

/// Links two bound local connections and opens both.
///
/// # Errors
///
/// `IllegalState` unless both are in `HALF_OPEN`, or when `a` and `b` are
/// the same connection. If opening the second side fails, the first is
/// failed as well.
pub fn join(a: &Arc<LocalConnection>, b: &Arc<LocalConnection>) -> Result<(), ConnectionError> {
    // ---
    if Arc::ptr_eq(a, b) {
        return Err(ConnectionError::IllegalState {
            operation: "join",
            state: a.state(),
            reason: "Cannot join a connection to itself",
        });
    }

    let a_generation = a.begin_negotiation("join")?;
    let b_generation = b.begin_negotiation("join")?;

    *a.kind().peer.lock() = Some(Arc::downgrade(b));
    *b.kind().peer.lock() = Some(Arc::downgrade(a));

    if let Err(e) = a.open_checked(Some(a_generation)) {
        a.kind().unlink();
        return Err(e);
    }
    if let Err(e) = b.open_checked(Some(b_generation)) {
        a.fail(&e.to_string());
        b.kind().unlink();
        return Err(e);
    }

    debug!("Local connections {:x} and {:x} joined", a.id(), b.id());
    Ok(())
}

impl Connection<LocalLink> {
    // ---
    /// Hands a frame to the joined peer.
    ///
    /// Returns `Ok(false)` when this side does not send or the peer does
    /// not receive in its current mode. Delivery refreshes the peer.
    ///
    /// # Errors
    ///
    /// `NoPeer` when not joined.
    pub fn send(&self, frame: Frame) -> Result<bool, ConnectionError> {
        // ---
        let peer = self.kind().peer().ok_or(ConnectionError::NoPeer(self.id()))?;
        if !self.mode().sends() || !peer.mode().receives() {
            return Ok(false);
        }

        peer.kind().deliver(frame);
        peer.refresh();
        Ok(true)
    }

    /// Next frame sent by the peer, if any.
    pub fn receive(&self) -> Option<Frame> {
        // ---
        self.kind().inbox.lock().pop_front()
    }
}
