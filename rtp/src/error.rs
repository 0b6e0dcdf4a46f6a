//! Error types for SDP handling, format negotiation and media sessions.

use crate::format::MediaType;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// A session description could not be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SdpError {
    #[error("missing required field `{0}=`")]
    MissingField(char),

    #[error("malformed `{field}=` line: {line}")]
    Malformed { field: char, line: String },

    #[error("unresolvable address `{0}`")]
    Address(String),
}

/// Offer/answer could not agree on a media configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("{0} codecs are not negotiated")]
    CodecsNotNegotiated(MediaType),

    #[error("remote description has no {0} media")]
    MissingMedia(MediaType),

    #[error("remote {0} media has no usable connection address")]
    NoRemoteAddress(MediaType),

    #[error("remote requested DTLS-SRTP but no local certificate fingerprint is configured")]
    DtlsUnavailable,

    #[error(transparent)]
    Sdp(#[from] SdpError),
}

/// A media session operation failed.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("{0} session is not open")]
    NotOpen(MediaType),

    #[error("{0} session has no remote peer yet")]
    NoRemotePeer(MediaType),

    #[error("{0} session has no negotiated {1} format")]
    NoFormat(MediaType, &'static str),

    #[error("RTP failure: {0}")]
    RtpFailure(String),
}
