//! Session Description Protocol (RFC 4566) model.
//!
//! Only the fields the gateway acts on are modelled explicitly. Everything
//! else is kept as an opaque attribute so it survives a parse/print cycle.

mod builder;
mod parse;

pub use builder::{LocalMedia, SdpBuilder};

use crate::error::SdpError;
use crate::format::{MediaType, RtpFormat};
use mgw_common::ConnectionMode;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Profile used on every generated `m=` line.
pub const RTP_AVP: &str = "RTP/AVP";

/// Profile for DTLS-protected media.
pub const RTP_SAVPF: &str = "UDP/TLS/RTP/SAVPF";

/// `o=` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub address_type: String,
    pub address: String,
}

impl Origin {
    // ---
    pub fn new(session_id: impl Into<String>, address: impl Into<String>) -> Self {
        // ---
        let address = address.into();
        Self {
            username: "-".to_string(),
            session_id: session_id.into(),
            session_version: "1".to_string(),
            address_type: address_type_of(&address).to_string(),
            address,
        }
    }
}

/// `c=` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionField {
    pub address_type: String,
    pub address: String,
}

impl ConnectionField {
    // ---
    pub fn new(address: impl Into<String>) -> Self {
        // ---
        let address = address.into();
        Self {
            address_type: address_type_of(&address).to_string(),
            address,
        }
    }

    pub fn ip(&self) -> Result<IpAddr, SdpError> {
        // ---
        self.address
            .parse()
            .map_err(|_| SdpError::Address(self.address.clone()))
    }
}

fn address_type_of(address: &str) -> &'static str {
    // ---
    if address.contains(':') {
        "IP6"
    } else {
        "IP4"
    }
}

/// ICE username fragment and password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

/// `a=candidate` (RFC 8445 section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: String,
    pub component: u8,
    pub transport: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub kind: String,
}

impl Candidate {
    // ---
    /// Host candidate with the conventional type preference of 126.
    pub fn host(component: u8, addr: SocketAddr) -> Self {
        // ---
        let priority = (126u32 << 24) | (65535 << 8) | (256 - component as u32);
        Self {
            foundation: "1".to_string(),
            component,
            transport: "udp".to_string(),
            priority,
            address: addr.ip().to_string(),
            port: addr.port(),
            kind: "host".to_string(),
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport,
            self.priority,
            self.address,
            self.port,
            self.kind
        )
    }
}

/// `a=fingerprint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub hash: String,
    pub value: String,
}

impl FromStr for Fingerprint {
    type Err = SdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hash, value) = s.trim().split_once(' ').ok_or_else(|| SdpError::Malformed {
            field: 'a',
            line: format!("fingerprint:{s}"),
        })?;
        Ok(Self {
            hash: hash.to_string(),
            value: value.trim().to_string(),
        })
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.hash, self.value)
    }
}

/// `a=setup` (RFC 4145).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupRole {
    Active,
    Passive,
    ActPass,
    HoldConn,
}

impl SetupRole {
    // ---
    pub fn as_str(self) -> &'static str {
        // ---
        match self {
            SetupRole::Active => "active",
            SetupRole::Passive => "passive",
            SetupRole::ActPass => "actpass",
            SetupRole::HoldConn => "holdconn",
        }
    }
}

impl FromStr for SetupRole {
    type Err = SdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "active" => Ok(SetupRole::Active),
            "passive" => Ok(SetupRole::Passive),
            "actpass" => Ok(SetupRole::ActPass),
            "holdconn" => Ok(SetupRole::HoldConn),
            other => Err(SdpError::Malformed {
                field: 'a',
                line: format!("setup:{other}"),
            }),
        }
    }
}

/// `a=ssrc:<id> cname:<cname>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsrcAttribute {
    pub ssrc: u32,
    pub cname: Option<String>,
}

/// `a=rtcp:<port> [IN IP4 <address>]` (RFC 3605).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpAttribute {
    pub port: u16,
    pub address: Option<String>,
}

/// Any attribute the model does not interpret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: Option<String>,
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "a={}:{}", self.name, value),
            None => write!(f, "a={}", self.name),
        }
    }
}

/// One `m=` section.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaDescription {
    // ---
    /// Media token as written (`audio`, `video`, ...)
    pub media: String,
    pub port: u16,
    pub protocol: String,

    /// Format tokens from the `m=` line, payload numbers for RTP media
    pub formats: Vec<String>,

    pub connection: Option<ConnectionField>,

    /// `a=rtpmap` entries in the order they appeared
    pub rtpmaps: Vec<RtpFormat>,

    /// `a=fmtp` parameters by payload type
    pub fmtps: BTreeMap<u8, String>,

    pub ptime: Option<u32>,
    pub direction: Option<ConnectionMode>,
    pub rtcp: Option<RtcpAttribute>,
    pub rtcp_mux: bool,
    pub ice: Option<IceCredentials>,
    pub candidates: Vec<Candidate>,
    pub fingerprint: Option<Fingerprint>,
    pub setup: Option<SetupRole>,
    pub ssrc: Option<SsrcAttribute>,
    pub attributes: Vec<Attribute>,
}

impl MediaDescription {
    // ---
    pub fn new(media: MediaType, port: u16, protocol: &str) -> Self {
        // ---
        Self {
            media: media.as_str().to_string(),
            port,
            protocol: protocol.to_string(),
            ..Self::default()
        }
    }

    pub fn media_type(&self) -> Option<MediaType> {
        // ---
        self.media.parse().ok()
    }

    /// Numeric entries of the format list, in offer order.
    pub fn payload_types(&self) -> Vec<u8> {
        // ---
        self.formats.iter().filter_map(|f| f.parse().ok()).collect()
    }

    /// Adds a payload with its `a=rtpmap` (and `a=fmtp` when it has parameters).
    pub fn add_format(&mut self, format: &RtpFormat) {
        // ---
        self.formats.push(format.payload_type.to_string());
        if let Some(parameters) = &format.parameters {
            self.fmtps.insert(format.payload_type, parameters.clone());
        }
        self.rtpmaps.push(RtpFormat {
            parameters: None,
            ..format.clone()
        });
    }

    /// The `a=rtpmap` entry for `payload_type`, with its `a=fmtp` parameters.
    pub fn rtpmap(&self, payload_type: u8) -> Option<RtpFormat> {
        // ---
        let mut format = self
            .rtpmaps
            .iter()
            .find(|f| f.payload_type == payload_type)?
            .clone();
        format.parameters = self.fmtps.get(&payload_type).cloned();
        Some(format)
    }

    /// Port 0 marks a rejected or disabled stream.
    pub fn is_rejected(&self) -> bool {
        // ---
        self.port == 0
    }

    pub fn contains_ice(&self) -> bool {
        // ---
        self.ice.is_some() || !self.candidates.is_empty()
    }
}

/// A complete session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    // ---
    pub version: u8,
    pub origin: Origin,
    pub session_name: String,
    pub connection: Option<ConnectionField>,
    pub timing: (u64, u64),
    pub ice_lite: bool,
    pub ice: Option<IceCredentials>,
    pub fingerprint: Option<Fingerprint>,
    pub setup: Option<SetupRole>,
    pub direction: Option<ConnectionMode>,
    pub attributes: Vec<Attribute>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    // ---
    pub fn new(origin: Origin, session_name: impl Into<String>) -> Self {
        // ---
        Self {
            version: 0,
            origin,
            session_name: session_name.into(),
            connection: None,
            timing: (0, 0),
            ice_lite: false,
            ice: None,
            fingerprint: None,
            setup: None,
            direction: None,
            attributes: Vec::new(),
            media: Vec::new(),
        }
    }

    /// Parses SDP text. Accepts `\n` or `\r\n` line endings.
    ///
    /// # Errors
    ///
    /// Returns `SdpError` if a required line (`v=`, `o=`, `s=`, `t=`) is
    /// missing or any interpreted line is malformed.
    pub fn parse(text: &str) -> Result<Self, SdpError> {
        // ---
        parse::parse(text)
    }

    /// First non-rejected `m=` section of the given kind.
    pub fn media_description(&self, media: MediaType) -> Option<&MediaDescription> {
        // ---
        self.media
            .iter()
            .find(|md| md.media_type() == Some(media) && !md.is_rejected())
    }

    pub fn contains_ice(&self) -> bool {
        // ---
        self.ice_lite || self.ice.is_some() || self.media.iter().any(|md| md.contains_ice())
    }

    pub fn contains_dtls(&self) -> bool {
        // ---
        self.fingerprint.is_some() || self.media.iter().any(|md| md.fingerprint.is_some())
    }

    /// Media-level `c=` falling back to the session-level one.
    pub fn effective_connection<'a>(
        &'a self,
        md: &'a MediaDescription,
    ) -> Option<&'a ConnectionField> {
        // ---
        md.connection.as_ref().or(self.connection.as_ref())
    }

    /// Media-level direction falling back to the session-level one, then
    /// to `sendrecv`.
    pub fn effective_direction(&self, md: &MediaDescription) -> ConnectionMode {
        // ---
        md.direction
            .or(self.direction)
            .unwrap_or(ConnectionMode::SendRecv)
    }

    /// Where the remote expects RTP for `md`.
    pub fn rtp_address(&self, md: &MediaDescription) -> Result<Option<SocketAddr>, SdpError> {
        // ---
        match self.effective_connection(md) {
            Some(connection) => Ok(Some(SocketAddr::new(connection.ip()?, md.port))),
            None => Ok(None),
        }
    }

    /// Where the remote expects RTCP for `md`: the RTP address under
    /// rtcp-mux, the `a=rtcp` port when given, otherwise RTP port + 1.
    pub fn rtcp_address(&self, md: &MediaDescription) -> Result<Option<SocketAddr>, SdpError> {
        // ---
        let Some(rtp) = self.rtp_address(md)? else {
            return Ok(None);
        };
        if md.rtcp_mux {
            return Ok(Some(rtp));
        }
        match &md.rtcp {
            Some(RtcpAttribute {
                port,
                address: Some(address),
            }) => {
                let ip = address
                    .parse()
                    .map_err(|_| SdpError::Address(address.clone()))?;
                Ok(Some(SocketAddr::new(ip, *port)))
            }
            Some(RtcpAttribute { port, address: None }) => Ok(Some(SocketAddr::new(rtp.ip(), *port))),
            None => Ok(Some(SocketAddr::new(rtp.ip(), rtp.port().wrapping_add(1)))),
        }
    }
}

impl FromStr for SessionDescription {
    type Err = SdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn write_ice(f: &mut fmt::Formatter<'_>, ice: &IceCredentials) -> fmt::Result {
    // ---
    write!(f, "a=ice-ufrag:{}\r\n", ice.ufrag)?;
    write!(f, "a=ice-pwd:{}\r\n", ice.pwd)
}

impl fmt::Display for MediaDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m={} {} {}", self.media, self.port, self.protocol)?;
        for format in &self.formats {
            write!(f, " {format}")?;
        }
        f.write_str("\r\n")?;

        if let Some(c) = &self.connection {
            write!(f, "c=IN {} {}\r\n", c.address_type, c.address)?;
        }
        if let Some(rtcp) = &self.rtcp {
            match &rtcp.address {
                Some(address) => write!(
                    f,
                    "a=rtcp:{} IN {} {}\r\n",
                    rtcp.port,
                    address_type_of(address),
                    address
                )?,
                None => write!(f, "a=rtcp:{}\r\n", rtcp.port)?,
            }
        }
        if self.rtcp_mux {
            f.write_str("a=rtcp-mux\r\n")?;
        }
        if let Some(ice) = &self.ice {
            write_ice(f, ice)?;
        }
        for candidate in &self.candidates {
            write!(f, "a=candidate:{candidate}\r\n")?;
        }
        if let Some(fingerprint) = &self.fingerprint {
            write!(f, "a=fingerprint:{fingerprint}\r\n")?;
        }
        if let Some(setup) = self.setup {
            write!(f, "a=setup:{}\r\n", setup.as_str())?;
        }
        for pt in self.payload_types() {
            if let Some(rtpmap) = self.rtpmaps.iter().find(|r| r.payload_type == pt) {
                write!(f, "a=rtpmap:{}\r\n", rtpmap.rtpmap())?;
            }
            if let Some(fmtp) = self.fmtps.get(&pt) {
                write!(f, "a=fmtp:{pt} {fmtp}\r\n")?;
            }
        }
        if let Some(ptime) = self.ptime {
            write!(f, "a=ptime:{ptime}\r\n")?;
        }
        if let Some(direction) = self.direction {
            write!(f, "a={}\r\n", direction.sdp_attribute())?;
        }
        if let Some(ssrc) = &self.ssrc {
            match &ssrc.cname {
                Some(cname) => write!(f, "a=ssrc:{} cname:{}\r\n", ssrc.ssrc, cname)?,
                None => write!(f, "a=ssrc:{}\r\n", ssrc.ssrc)?,
            }
        }
        for attribute in &self.attributes {
            write!(f, "{attribute}\r\n")?;
        }
        Ok(())
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.origin;
        write!(f, "v={}\r\n", self.version)?;
        write!(
            f,
            "o={} {} {} IN {} {}\r\n",
            o.username, o.session_id, o.session_version, o.address_type, o.address
        )?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(c) = &self.connection {
            write!(f, "c=IN {} {}\r\n", c.address_type, c.address)?;
        }
        write!(f, "t={} {}\r\n", self.timing.0, self.timing.1)?;

        if self.ice_lite {
            f.write_str("a=ice-lite\r\n")?;
        }
        if let Some(ice) = &self.ice {
            write_ice(f, ice)?;
        }
        if let Some(fingerprint) = &self.fingerprint {
            write!(f, "a=fingerprint:{fingerprint}\r\n")?;
        }
        if let Some(setup) = self.setup {
            write!(f, "a=setup:{}\r\n", setup.as_str())?;
        }
        if let Some(direction) = self.direction {
            write!(f, "a={}\r\n", direction.sdp_attribute())?;
        }
        for attribute in &self.attributes {
            write!(f, "{attribute}\r\n")?;
        }
        for md in &self.media {
            write!(f, "{md}")?;
        }
        Ok(())
    }
}
