//! Media Gateway RTP Library
//!
//! Provides the media plane of the gateway: RTP clocks, payload format
//! tables, SDP offer/answer handling, the jitter buffer and the UDP media
//! session that ties them together. The connection layer drives these
//! pieces; integration tests use them directly.

pub mod clock;
pub mod error;
pub mod format;
pub mod jitter_buffer;
pub mod negotiation;
pub mod port;
pub mod sdp;
pub mod session;
pub mod stats;
pub mod transport;

pub use clock::{ManualClock, RtpClock, SystemClock, WallClock};
pub use error::{NegotiationError, SdpError, SessionError};
pub use format::{AvProfile, MediaType, RtpFormat, RtpFormats};
pub use jitter_buffer::{Frame, JitterBuffer, JitterBufferConfig, WriteOutcome};
pub use mgw_common::RtpPacket;
pub use negotiation::FormatNegotiator;
pub use port::PortManager;
pub use sdp::{LocalMedia, MediaDescription, SdpBuilder, SessionDescription};
pub use session::{generate_cname, MediaSession, SessionConfig};
pub use stats::RtpStatistics;
