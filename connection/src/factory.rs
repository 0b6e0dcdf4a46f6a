//! Connection factory and pool.
//!
//! The factory owns the id generator, the shared RTP port range and one
//! pool of idle connections per type. Pooled connections keep their id and
//! their sessions; `bind` resets everything per-call.

use crate::config::GatewayConfig;
use crate::connection::{Connection, ConnectionType};
use crate::endpoint::Endpoint;
use crate::error::ConnectionError;
use crate::listener::{ConnectionListener, FailureListener};
use crate::local::{LocalConnection, LocalLink};
use crate::rtp::{RtpConnection, RtpMedia};
use crate::scheduler::Scheduler;
use crate::state::ConnectionState;
use mgw_common::{ConnectionMode, MetricsContext};
use mgw_rtp::{MediaSession, MediaType, PortManager, SessionConfig, WallClock};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Process-unique connection ids, starting at 1. Zero is never issued.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU32,
}

impl IdGenerator {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            next: AtomicU32::new(1),
        }
    }

    pub fn next_id(&self) -> u32 {
        // ---
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A connection of either type.
#[derive(Debug, Clone)]
pub enum AnyConnection {
    Local(Arc<LocalConnection>),
    Rtp(Arc<RtpConnection>),
}

macro_rules! delegate {
    ($self:ident, $conn:ident => $body:expr) => {
        match $self {
            AnyConnection::Local($conn) => $body,
            AnyConnection::Rtp($conn) => $body,
        }
    };
}

impl AnyConnection {
    // ---
    pub fn id(&self) -> u32 {
        delegate!(self, c => c.id())
    }

    pub fn textual_id(&self) -> String {
        delegate!(self, c => c.textual_id())
    }

    pub fn connection_type(&self) -> ConnectionType {
        delegate!(self, c => c.connection_type())
    }

    pub fn state(&self) -> ConnectionState {
        delegate!(self, c => c.state())
    }

    pub fn mode(&self) -> ConnectionMode {
        delegate!(self, c => c.mode())
    }

    pub fn bind(&self) -> Result<(), ConnectionError> {
        delegate!(self, c => c.bind())
    }

    pub fn close(&self) -> Result<(), ConnectionError> {
        delegate!(self, c => c.close())
    }

    pub fn fail(&self, reason: &str) {
        delegate!(self, c => c.fail(reason))
    }

    pub fn set_mode(&self, mode: ConnectionMode) -> Result<(), ConnectionError> {
        delegate!(self, c => c.set_mode(mode))
    }

    pub fn set_endpoint(&self, endpoint: &Arc<dyn Endpoint>) {
        delegate!(self, c => c.set_endpoint(endpoint))
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        delegate!(self, c => c.add_listener(listener))
    }

    pub fn set_failure_listener(&self, listener: Arc<dyn FailureListener>) {
        delegate!(self, c => c.set_failure_listener(listener))
    }

    pub fn as_rtp(&self) -> Option<&Arc<RtpConnection>> {
        // ---
        match self {
            AnyConnection::Rtp(conn) => Some(conn),
            AnyConnection::Local(_) => None,
        }
    }

    pub fn as_local(&self) -> Option<&Arc<LocalConnection>> {
        // ---
        match self {
            AnyConnection::Local(conn) => Some(conn),
            AnyConnection::Rtp(_) => None,
        }
    }
}

/// Builds and recycles connections.
pub struct ConnectionFactory {
    // ---
    config: GatewayConfig,
    scheduler: Arc<Scheduler>,
    wall: Arc<dyn WallClock>,
    ports: Arc<PortManager>,
    ids: IdGenerator,
    metrics: Option<MetricsContext>,
    rtp_pool: Mutex<Vec<Arc<RtpConnection>>>,
    local_pool: Mutex<Vec<Arc<LocalConnection>>>,
}

impl ConnectionFactory {
    // ---
    pub fn new(config: GatewayConfig, scheduler: Arc<Scheduler>, wall: Arc<dyn WallClock>) -> Self {
        // ---
        let ports = Arc::new(PortManager::new(config.rtp_port_low, config.rtp_port_high));
        Self {
            config,
            scheduler,
            wall,
            ports,
            ids: IdGenerator::new(),
            metrics: None,
            rtp_pool: Mutex::new(Vec::new()),
            local_pool: Mutex::new(Vec::new()),
        }
    }

    /// Counts connections and negotiation outcomes in `metrics`.
    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        // ---
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        // ---
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        // ---
        &self.scheduler
    }

    /// An idle connection of `connection_type`, pooled or new.
    pub fn create(&self, connection_type: ConnectionType) -> AnyConnection {
        // ---
        match connection_type {
            ConnectionType::Rtp => AnyConnection::Rtp(self.create_rtp()),
            ConnectionType::Local => AnyConnection::Local(self.create_local()),
        }
    }

    pub fn create_rtp(&self) -> Arc<RtpConnection> {
        // ---
        if let Some(conn) = self.rtp_pool.lock().pop() {
            debug!("Reusing pooled RTP connection {:x}", conn.id());
            return conn;
        }

        let audio = self.session(MediaType::Audio, self.config.audio_session_config());
        let video = self
            .config
            .session_config(MediaType::Video)
            .map(|config| self.session(MediaType::Video, config));
        let media = RtpMedia::new(
            audio,
            video,
            Arc::clone(&self.ports),
            self.config.bind_address,
            self.config.external_address.clone(),
        );

        let conn = Connection::new(
            self.ids.next_id(),
            media,
            self.config.timeouts,
            Arc::clone(&self.scheduler),
            self.metrics.clone(),
        );
        conn.schedule_media();
        self.created(ConnectionType::Rtp, conn.id());
        conn
    }

    pub fn create_local(&self) -> Arc<LocalConnection> {
        // ---
        if let Some(conn) = self.local_pool.lock().pop() {
            debug!("Reusing pooled local connection {:x}", conn.id());
            return conn;
        }

        let conn = Connection::new(
            self.ids.next_id(),
            LocalLink::default(),
            self.config.timeouts,
            Arc::clone(&self.scheduler),
            self.metrics.clone(),
        );
        self.created(ConnectionType::Local, conn.id());
        conn
    }

    /// Returns an idle connection to its pool.
    ///
    /// Listeners and the endpoint are dropped. Connections beyond the pool
    /// size are released.
    ///
    /// # Errors
    ///
    /// `InUse` unless the connection is in `NULL`.
    pub fn recycle(&self, conn: AnyConnection) -> Result<(), ConnectionError> {
        // ---
        let state = conn.state();
        if state != ConnectionState::Null {
            return Err(ConnectionError::InUse {
                id: conn.id(),
                state,
            });
        }

        let id = conn.id();
        let pooled = match conn {
            AnyConnection::Rtp(conn) => {
                conn.detach();
                push_bounded(&self.rtp_pool, conn, self.config.pool_size)
            }
            AnyConnection::Local(conn) => {
                conn.detach();
                push_bounded(&self.local_pool, conn, self.config.pool_size)
            }
        };
        debug!("Connection {:x} recycled (pooled={})", id, pooled);
        Ok(())
    }

    /// Idle connections waiting in the pool of `connection_type`.
    pub fn pooled(&self, connection_type: ConnectionType) -> usize {
        // ---
        match connection_type {
            ConnectionType::Rtp => self.rtp_pool.lock().len(),
            ConnectionType::Local => self.local_pool.lock().len(),
        }
    }

    fn session(&self, media: MediaType, config: SessionConfig) -> MediaSession {
        // ---
        let session = MediaSession::new(media, config, Arc::clone(&self.wall));
        match &self.metrics {
            Some(metrics) => session.with_metrics(metrics.clone()),
            None => session,
        }
    }

    fn created(&self, connection_type: ConnectionType, id: u32) {
        // ---
        if let Some(metrics) = &self.metrics {
            metrics.connections_created_total.inc();
        }
        info!("Created {} connection {:x}", connection_type, id);
    }
}

fn push_bounded<T>(pool: &Mutex<Vec<T>>, item: T, limit: usize) -> bool {
    // ---
    let mut pool = pool.lock();
    if pool.len() >= limit {
        return false;
    }
    pool.push(item);
    true
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("rtp_pooled", &self.pooled(ConnectionType::Rtp))
            .field("local_pooled", &self.pooled(ConnectionType::Local))
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
