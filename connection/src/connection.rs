//! Connection lifecycle.
//!
//! A [`Connection`] runs the `NULL -> HALF_OPEN -> OPEN` state machine for
//! one media leg. What a transition does to media resources is up to the
//! connection's [`ConnectionKind`]; the state machine, heartbeat and
//! listener dispatch are shared.
//!
//! All transitions of one connection are serialized by its lock, and kind
//! hooks run while it is held. Listeners, the endpoint and the failure
//! listener are called after it is released.

use crate::endpoint::Endpoint;
use crate::error::ConnectionError;
use crate::listener::{dispatch_guarded, ConnectionListener, FailureListener, StateChange};
use crate::scheduler::{Queue, Scheduler, TaskStatus};
use crate::state::{ConnectionState, StateEvent, StateTimeouts, Transition};
use mgw_common::{ConnectionMode, MetricsContext};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// The two kinds of media leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    Rtp,
    Local,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Rtp => f.write_str("RTP"),
            ConnectionType::Local => f.write_str("LOCAL"),
        }
    }
}

/// Resource handling behind the state machine.
///
/// `on_created` and `on_opened` may refuse their transition by returning an
/// error. Errors from `on_closed` and `on_failed` are logged; the connection
/// reaches `NULL` regardless.
pub trait ConnectionKind: Send + Sync + 'static {
    const TYPE: ConnectionType;

    /// `NULL -> HALF_OPEN`: reset per-call state for a new binding.
    fn on_created(&self) -> anyhow::Result<()>;

    /// `HALF_OPEN -> OPEN`.
    fn on_opened(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Orderly return to `NULL`: release media resources.
    fn on_closed(&self) -> anyhow::Result<()>;

    /// Failure return to `NULL`: same cleanup as `on_closed`.
    fn on_failed(&self) -> anyhow::Result<()>;

    /// Applies a new mode to the media resources.
    fn apply_mode(&self, mode: ConnectionMode) -> anyhow::Result<()>;
}

struct ConnectionInner {
    state: ConnectionState,
    mode: ConnectionMode,

    /// Heartbeat ticks left in the current state
    ttl: u64,

    /// Bumped whenever the heartbeat is armed or disarmed; a heartbeat
    /// task only acts while its epoch is current
    heartbeat_epoch: u64,
    heartbeat_armed: bool,

    /// Bumped on every bind so async work can tell it outlived its binding
    generation: u64,

    endpoint: Option<Weak<dyn Endpoint>>,
}

/// Work left for after the lock is released.
#[derive(Default)]
struct Notifications {
    change: Option<StateChange>,
    mode: Option<(ConnectionMode, ConnectionMode)>,
    endpoint: Option<Arc<dyn Endpoint>>,
    release: bool,
    failure: Option<Arc<dyn FailureListener>>,
}

/// One media leg.
pub struct Connection<K: ConnectionKind> {
    // ---
    id: u32,
    kind: K,
    timeouts: StateTimeouts,
    scheduler: Arc<Scheduler>,
    this: Weak<Connection<K>>,
    metrics: Option<MetricsContext>,
    inner: Mutex<ConnectionInner>,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    failure_listener: Mutex<Option<Arc<dyn FailureListener>>>,
}

impl<K: ConnectionKind> Connection<K> {
    // ---
    /// Creates an idle connection.
    ///
    /// # Arguments
    ///
    /// * `id` - Process-unique identifier, usually from the factory
    /// * `kind` - Resource handling for this leg
    /// * `timeouts` - Per-state heartbeat budgets
    /// * `scheduler` - Scheduler whose heartbeat queue drives the TTL
    /// * `metrics` - Optional connection gauges and counters
    pub fn new(
        id: u32,
        kind: K,
        timeouts: StateTimeouts,
        scheduler: Arc<Scheduler>,
        metrics: Option<MetricsContext>,
    ) -> Arc<Self> {
        // ---
        Arc::new_cyclic(|this| Self {
            id,
            kind,
            timeouts,
            scheduler,
            this: this.clone(),
            metrics,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Null,
                mode: ConnectionMode::Inactive,
                ttl: 0,
                heartbeat_epoch: 0,
                heartbeat_armed: false,
                generation: 0,
                endpoint: None,
            }),
            listeners: Mutex::new(Vec::new()),
            failure_listener: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u32 {
        // ---
        self.id
    }

    /// Hexadecimal id, as reported to call control.
    pub fn textual_id(&self) -> String {
        // ---
        format!("{:x}", self.id)
    }

    pub fn kind(&self) -> &K {
        // ---
        &self.kind
    }

    pub fn connection_type(&self) -> ConnectionType {
        // ---
        K::TYPE
    }

    pub fn state(&self) -> ConnectionState {
        // ---
        self.inner.lock().state
    }

    pub fn mode(&self) -> ConnectionMode {
        // ---
        self.inner.lock().mode
    }

    /// Heartbeat ticks left before the connection fails.
    pub fn ttl(&self) -> u64 {
        // ---
        self.inner.lock().ttl
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        // ---
        &self.scheduler
    }

    pub(crate) fn metrics(&self) -> Option<&MetricsContext> {
        // ---
        self.metrics.as_ref()
    }

    pub(crate) fn weak(&self) -> Weak<Connection<K>> {
        // ---
        self.this.clone()
    }

    /// Attaches the owning endpoint. Only a weak reference is kept.
    pub fn set_endpoint(&self, endpoint: &Arc<dyn Endpoint>) {
        // ---
        self.inner.lock().endpoint = Some(Arc::downgrade(endpoint));
    }

    pub fn endpoint(&self) -> Option<Arc<dyn Endpoint>> {
        // ---
        self.inner.lock().endpoint.as_ref().and_then(Weak::upgrade)
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        // ---
        self.listeners.lock().push(listener);
    }

    /// Removes a listener previously added. Returns whether it was found.
    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        // ---
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Replaces the failure listener. It is consumed by the next close or
    /// failure, so it fires at most once per binding.
    pub fn set_failure_listener(&self, listener: Arc<dyn FailureListener>) {
        // ---
        *self.failure_listener.lock() = Some(listener);
    }

    /// `NULL -> HALF_OPEN`.
    ///
    /// # Errors
    ///
    /// `IllegalState` when already bound, `Hook` when `on_created` fails.
    /// The connection stays in `NULL` on error.
    pub fn bind(&self) -> Result<(), ConnectionError> {
        // ---
        let mut inner = self.inner.lock();
        let Some(next) = self.check(&inner, StateEvent::Bind)? else {
            return Ok(());
        };

        self.kind
            .on_created()
            .map_err(|e| ConnectionError::hook("on_created", e))?;

        inner.generation += 1;
        let change = self.enter(&mut inner, next);
        drop(inner);

        self.notify(Notifications {
            change: Some(change),
            ..Default::default()
        });
        Ok(())
    }

    /// `HALF_OPEN -> OPEN`.
    ///
    /// # Errors
    ///
    /// `IllegalState` when not bound or already open, `Hook` when
    /// `on_opened` fails.
    pub fn open(&self) -> Result<(), ConnectionError> {
        // ---
        self.open_checked(None)
    }

    /// Opens only if the binding identified by `generation` is still live.
    pub(crate) fn open_checked(&self, generation: Option<u64>) -> Result<(), ConnectionError> {
        // ---
        let mut inner = self.inner.lock();
        if let Some(generation) = generation {
            self.ensure_generation(&inner, generation)?;
        }
        let Some(next) = self.check(&inner, StateEvent::Open)? else {
            return Ok(());
        };

        self.kind
            .on_opened()
            .map_err(|e| ConnectionError::hook("on_opened", e))?;

        let change = self.enter(&mut inner, next);
        drop(inner);

        self.notify(Notifications {
            change: Some(change),
            ..Default::default()
        });
        Ok(())
    }

    /// Returns the connection to `NULL`, releasing media resources and the
    /// endpoint reference. Closing an idle connection does nothing.
    pub fn close(&self) -> Result<(), ConnectionError> {
        // ---
        let inner = self.inner.lock();
        if self.check(&inner, StateEvent::Close)?.is_none() {
            return Ok(());
        }
        self.teardown(inner, StateEvent::Close);
        Ok(())
    }

    /// Returns the connection to `NULL` through the failure path and tells
    /// the failure listener. Ignored when already idle.
    pub fn fail(&self, reason: &str) {
        // ---
        self.fail_checked(None, reason);
    }

    /// Fails the connection only while the binding `generation` is live.
    pub(crate) fn fail_checked(&self, generation: Option<u64>, reason: &str) {
        // ---
        let inner = self.inner.lock();
        if !inner.state.is_bound() || generation.is_some_and(|g| g != inner.generation) {
            return;
        }
        warn!("Connection {:x} failed in state {}: {}", self.id, inner.state, reason);
        self.teardown(inner, StateEvent::Fail);
    }

    /// Changes the send/receive mode.
    ///
    /// The media resources are updated first, then the connection's own
    /// mode, then the endpoint is told the old and new values. Setting the
    /// current mode again is a no-op.
    ///
    /// # Errors
    ///
    /// `IllegalState` in `NULL`, `Hook` when the media resources refuse.
    pub fn set_mode(&self, mode: ConnectionMode) -> Result<(), ConnectionError> {
        // ---
        let mut inner = self.inner.lock();
        if !inner.state.is_bound() {
            return Err(ConnectionError::IllegalState {
                operation: "set mode",
                state: inner.state,
                reason: "Connection not bound yet",
            });
        }
        if inner.mode == mode {
            return Ok(());
        }

        self.kind
            .apply_mode(mode)
            .map_err(|e| ConnectionError::hook("apply_mode", e))?;

        let old = std::mem::replace(&mut inner.mode, mode);
        let endpoint = inner.endpoint.as_ref().and_then(Weak::upgrade);
        drop(inner);

        debug!("Connection {:x} mode {} -> {}", self.id, old, mode);
        self.notify(Notifications {
            mode: Some((old, mode)),
            endpoint,
            ..Default::default()
        });
        Ok(())
    }

    /// Restores the full TTL of the current state. Media activity calls
    /// this so a live stream never times out.
    pub fn refresh(&self) {
        // ---
        let mut inner = self.inner.lock();
        if inner.state.is_bound() {
            inner.ttl = self.timeouts.ttl(inner.state, self.scheduler.heartbeat_resolution());
        }
    }

    /// Checks that an offer/answer step may start, which is only the case
    /// in `HALF_OPEN`, and returns the current bind generation.
    pub(crate) fn begin_negotiation(&self, operation: &'static str) -> Result<u64, ConnectionError> {
        // ---
        let inner = self.inner.lock();
        match inner.state.on(StateEvent::Open) {
            Transition::Next(_) => Ok(inner.generation),
            Transition::Illegal(reason) => Err(ConnectionError::IllegalState {
                operation,
                state: inner.state,
                reason,
            }),
            Transition::Ignore => Err(ConnectionError::Closed(self.id)),
        }
    }

    /// Fails with `Closed` unless the binding `generation` is still live.
    pub(crate) fn ensure_current(&self, generation: u64) -> Result<(), ConnectionError> {
        // ---
        let inner = self.inner.lock();
        self.ensure_generation(&inner, generation)
    }

    fn ensure_generation(
        &self,
        inner: &ConnectionInner,
        generation: u64,
    ) -> Result<(), ConnectionError> {
        // ---
        if inner.generation != generation || !inner.state.is_bound() {
            return Err(ConnectionError::Closed(self.id));
        }
        Ok(())
    }

    /// Drops listeners and the endpoint before the connection is pooled.
    pub(crate) fn detach(&self) {
        // ---
        self.listeners.lock().clear();
        *self.failure_listener.lock() = None;
        self.inner.lock().endpoint = None;
    }

    /// Looks `event` up in the transition table for the current state.
    fn check(
        &self,
        inner: &ConnectionInner,
        event: StateEvent,
    ) -> Result<Option<ConnectionState>, ConnectionError> {
        // ---
        match inner.state.on(event) {
            Transition::Next(state) => Ok(Some(state)),
            Transition::Ignore => Ok(None),
            Transition::Illegal(reason) => Err(ConnectionError::IllegalState {
                operation: event.operation(),
                state: inner.state,
                reason,
            }),
        }
    }

    /// Switches state, recomputes the TTL and arms or disarms the heartbeat.
    fn enter(&self, inner: &mut ConnectionInner, next: ConnectionState) -> StateChange {
        // ---
        let old = inner.state;
        inner.state = next;
        inner.ttl = self.timeouts.ttl(next, self.scheduler.heartbeat_resolution());

        if inner.ttl == 0 {
            if inner.heartbeat_armed {
                inner.heartbeat_epoch += 1;
                inner.heartbeat_armed = false;
            }
        } else if !inner.heartbeat_armed {
            inner.heartbeat_epoch += 1;
            inner.heartbeat_armed = true;
            self.submit_heartbeat(inner.heartbeat_epoch);
        }

        if let Some(metrics) = &self.metrics {
            if next == ConnectionState::Open {
                metrics.connections_open.inc();
            } else if old == ConnectionState::Open {
                metrics.connections_open.dec();
            }
        }

        info!("Connection {:x} {} -> {}", self.id, old, next);
        StateChange {
            connection: self.id,
            old,
            new: next,
        }
    }

    fn submit_heartbeat(&self, epoch: u64) {
        // ---
        let connection = self.this.clone();
        self.scheduler.submit(Queue::Heartbeat, move || match connection.upgrade() {
            Some(connection) => connection.heartbeat(epoch),
            None => TaskStatus::Cancel,
        });
    }

    /// One heartbeat tick: decrement the TTL and fail on zero.
    fn heartbeat(&self, epoch: u64) -> TaskStatus {
        // ---
        let mut inner = self.inner.lock();
        if !inner.heartbeat_armed || inner.heartbeat_epoch != epoch {
            return TaskStatus::Cancel;
        }

        inner.ttl = inner.ttl.saturating_sub(1);
        if inner.ttl > 0 {
            return TaskStatus::Reschedule;
        }

        warn!(
            "Connection {:x} timed out in state {}",
            self.id, inner.state
        );
        self.teardown(inner, StateEvent::Fail);
        TaskStatus::Cancel
    }

    /// Common path back to `NULL` for close and fail.
    fn teardown(&self, mut inner: MutexGuard<'_, ConnectionInner>, event: StateEvent) {
        // ---
        let failed = event == StateEvent::Fail;
        if failed {
            dispatch_guarded("on_failed", || self.kind.on_failed());
        } else {
            dispatch_guarded("on_closed", || self.kind.on_closed());
        }

        let old_mode = std::mem::replace(&mut inner.mode, ConnectionMode::Inactive);
        let change = self.enter(&mut inner, ConnectionState::Null);
        let endpoint = inner.endpoint.take().and_then(|e| e.upgrade());
        drop(inner);

        let failure = self.failure_listener.lock().take();
        if failed {
            if let Some(metrics) = &self.metrics {
                metrics.connection_failures_total.inc();
            }
        }

        self.notify(Notifications {
            change: Some(change),
            mode: (old_mode != ConnectionMode::Inactive).then_some((old_mode, ConnectionMode::Inactive)),
            endpoint,
            release: true,
            failure: if failed { failure } else { None },
        });
    }

    fn notify(&self, notifications: Notifications) {
        // ---
        if let Some(change) = notifications.change {
            let listeners = self.listeners.lock().clone();
            for listener in listeners {
                dispatch_guarded("connection listener", || listener.state_changed(&change));
            }
        }

        if let Some(endpoint) = notifications.endpoint {
            if let Some((old, new)) = notifications.mode {
                dispatch_guarded("endpoint mode update", || {
                    endpoint.mode_updated(old, new);
                    Ok(())
                });
            }
            if notifications.release {
                dispatch_guarded("endpoint release", || {
                    endpoint.release_connection(self.id, K::TYPE);
                    Ok(())
                });
            }
        }

        if let Some(listener) = notifications.failure {
            dispatch_guarded("failure listener", || {
                listener.on_failure();
                Ok(())
            });
        }
    }
}

impl<K: ConnectionKind> fmt::Debug for Connection<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Connection")
            .field("id", &self.textual_id())
            .field("type", &K::TYPE)
            .field("state", &inner.state)
            .field("mode", &inner.mode)
            .field("ttl", &inner.ttl)
            .finish()
    }
}
