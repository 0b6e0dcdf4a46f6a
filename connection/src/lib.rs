//! Media Gateway Connection Library
//!
//! Provides the connection layer of the gateway: the `NULL -> HALF_OPEN ->
//! OPEN` state machine with its heartbeat, RTP connections negotiated with
//! SDP offer/answer, in-process local connections, and the factory that
//! creates and pools them. Call control drives connections through this
//! crate; the `gateway` binary is a thin CLI over it.

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod factory;
pub mod listener;
pub mod local;
pub mod rtp;
pub mod scheduler;
pub mod state;

pub use config::GatewayConfig;
pub use connection::{Connection, ConnectionKind, ConnectionType};
pub use endpoint::Endpoint;
pub use error::ConnectionError;
pub use factory::{AnyConnection, ConnectionFactory, IdGenerator};
pub use listener::{dispatch_guarded, ConnectionListener, FailureListener, StateChange};
pub use local::{join, LocalConnection, LocalLink};
pub use mgw_common::ConnectionMode;
pub use rtp::{FrameSink, RtpConnection, RtpMedia};
pub use scheduler::{Queue, Scheduler, TaskStatus};
pub use state::{ConnectionState, StateEvent, StateTimeouts, Transition};
