//! Shared wire types and ambient plumbing for the media gateway crates.
//!
//! Holds the RTP and RFC 2833 packet codecs, the connection mode values
//! exchanged with call control, and the tracing/metrics/CLI helpers every
//! binary uses the same way.

pub mod cli;
pub mod dtmf;
pub mod mode;
pub mod observability;
pub mod rtp;

pub use cli::ColorWhen;
pub use dtmf::DtmfEvent;
pub use mode::ConnectionMode;
pub use observability::{init_tracing, MetricsContext, MetricsServerConfig};
pub use rtp::{PacketError, RtpPacket};
