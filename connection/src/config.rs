//! Gateway configuration.

use crate::scheduler::{DEFAULT_HEARTBEAT_RESOLUTION, DEFAULT_MEDIA_PERIOD};
use crate::state::StateTimeouts;
use mgw_rtp::port::{DEFAULT_HIGH_PORT, DEFAULT_LOW_PORT};
use mgw_rtp::sdp::Fingerprint;
use mgw_rtp::{AvProfile, JitterBufferConfig, MediaType, RtpFormats, SessionConfig};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Idle connections kept for reuse by default.
pub const DEFAULT_POOL_SIZE: usize = 16;

/// Everything the connection factory needs to build connections.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // ---
    /// Address media sockets bind to
    pub bind_address: IpAddr,

    /// Address advertised in SDP when the gateway sits behind NAT
    pub external_address: Option<String>,

    /// RTP port range, inclusive. Only even ports are used.
    pub rtp_port_low: u16,
    pub rtp_port_high: u16,

    pub timeouts: StateTimeouts,

    /// Heartbeat ticks per second
    pub heartbeat_resolution: u32,

    pub media_period: Duration,
    pub jitter: JitterBufferConfig,
    pub audio_formats: RtpFormats,

    /// Video capabilities; offered video is rejected when unset
    pub video_formats: Option<RtpFormats>,

    /// Local certificate fingerprint for DTLS-SRTP
    pub dtls_fingerprint: Option<Fingerprint>,

    /// Idle connections kept per type
    pub pool_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        // ---
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            external_address: None,
            rtp_port_low: DEFAULT_LOW_PORT,
            rtp_port_high: DEFAULT_HIGH_PORT,
            timeouts: StateTimeouts::default(),
            heartbeat_resolution: DEFAULT_HEARTBEAT_RESOLUTION,
            media_period: DEFAULT_MEDIA_PERIOD,
            jitter: JitterBufferConfig::default(),
            audio_formats: AvProfile::audio(),
            video_formats: None,
            dtls_fingerprint: None,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl GatewayConfig {
    // ---
    /// Session configuration for `media`, or None when that media type is
    /// not configured.
    pub fn session_config(&self, media: MediaType) -> Option<SessionConfig> {
        // ---
        match media {
            MediaType::Audio => Some(self.audio_session_config()),
            MediaType::Video => Some(self.with_formats(self.video_formats.clone()?)),
            MediaType::Application => None,
        }
    }

    pub fn audio_session_config(&self) -> SessionConfig {
        // ---
        self.with_formats(self.audio_formats.clone())
    }

    fn with_formats(&self, formats: RtpFormats) -> SessionConfig {
        // ---
        let mut config = SessionConfig::new(formats);
        config.jitter = self.jitter.clone();
        config.dtls_fingerprint = self.dtls_fingerprint.clone();
        config
    }
}
