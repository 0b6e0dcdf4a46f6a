//! Connection mode exchanged with call control.

use std::fmt;
use std::str::FromStr;

/// Send/receive direction of a media leg.
///
/// These four values are the only legal modes; they map one-to-one onto the
/// SDP direction attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionMode {
    #[default]
    Inactive,
    SendOnly,
    RecvOnly,
    SendRecv,
}

impl ConnectionMode {
    // ---
    /// Whether the transmit channel runs in this mode.
    pub fn sends(self) -> bool {
        // ---
        matches!(self, ConnectionMode::SendOnly | ConnectionMode::SendRecv)
    }

    /// Whether the receive channel runs in this mode.
    pub fn receives(self) -> bool {
        // ---
        matches!(self, ConnectionMode::RecvOnly | ConnectionMode::SendRecv)
    }

    /// SDP direction attribute name (`a=sendrecv` etc.).
    pub fn sdp_attribute(self) -> &'static str {
        // ---
        match self {
            ConnectionMode::Inactive => "inactive",
            ConnectionMode::SendOnly => "sendonly",
            ConnectionMode::RecvOnly => "recvonly",
            ConnectionMode::SendRecv => "sendrecv",
        }
    }

    /// Direction the peer should use to answer this one (RFC 3264 section 6.1).
    pub fn reversed(self) -> Self {
        // ---
        match self {
            ConnectionMode::SendOnly => ConnectionMode::RecvOnly,
            ConnectionMode::RecvOnly => ConnectionMode::SendOnly,
            other => other,
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionMode::Inactive => "INACTIVE",
            ConnectionMode::SendOnly => "SEND_ONLY",
            ConnectionMode::RecvOnly => "RECV_ONLY",
            ConnectionMode::SendRecv => "SEND_RECV",
        };
        f.write_str(name)
    }
}

impl FromStr for ConnectionMode {
    type Err = String;

    /// Accepts both the call-control spelling and the SDP attribute name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "").as_str() {
            "inactive" => Ok(ConnectionMode::Inactive),
            "sendonly" => Ok(ConnectionMode::SendOnly),
            "recvonly" => Ok(ConnectionMode::RecvOnly),
            "sendrecv" => Ok(ConnectionMode::SendRecv),
            _ => Err(format!("unknown connection mode: {s}")),
        }
    }
}
