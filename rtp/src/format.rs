//! RTP payload formats, ordered format tables and the AV profile.

use std::fmt;
use std::str::FromStr;

/// Lowest dynamic payload type (RFC 3551 section 3).
pub const DYNAMIC_PT_MIN: u8 = 96;

/// Highest dynamic payload type.
pub const DYNAMIC_PT_MAX: u8 = 127;

/// Payload type advertised for RFC 2833 events in generated offers.
pub const DEFAULT_DTMF_PAYLOAD: u8 = 101;

/// Encoding name of RFC 2833 events.
pub const TELEPHONE_EVENT: &str = "telephone-event";

/// Media kind of an `m=` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Audio,
    Video,
    Application,
}

impl MediaType {
    // ---
    pub fn as_str(self) -> &'static str {
        // ---
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::Application => "application",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The failure reason reads "Audio codecs are not negotiated".
        let name = match self {
            MediaType::Audio => "Audio",
            MediaType::Video => "Video",
            MediaType::Application => "Application",
        };
        f.write_str(name)
    }
}

impl FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "audio" => Ok(MediaType::Audio),
            "video" => Ok(MediaType::Video),
            "application" => Ok(MediaType::Application),
            _ => Err(format!("unsupported media type: {s}")),
        }
    }
}

/// One payload-type to encoding mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpFormat {
    // ---
    pub payload_type: u8,

    /// Encoding name as written in `a=rtpmap` (`PCMU`, `telephone-event`)
    pub encoding: String,

    /// Sampling rate in Hz
    pub clock_rate: u32,

    /// Audio channel count, 1 unless stated otherwise
    pub channels: u8,

    /// `a=fmtp` parameters, passed through verbatim
    pub parameters: Option<String>,
}

impl RtpFormat {
    // ---
    pub fn new(payload_type: u8, encoding: &str, clock_rate: u32) -> Self {
        // ---
        Self {
            payload_type,
            encoding: encoding.to_string(),
            clock_rate,
            channels: 1,
            parameters: None,
        }
    }

    pub fn with_channels(mut self, channels: u8) -> Self {
        // ---
        self.channels = channels.max(1);
        self
    }

    pub fn with_parameters(mut self, parameters: impl Into<String>) -> Self {
        // ---
        self.parameters = Some(parameters.into());
        self
    }

    /// Same format under a different payload number.
    pub fn renumbered(&self, payload_type: u8) -> Self {
        // ---
        Self {
            payload_type,
            ..self.clone()
        }
    }

    pub fn is_dtmf(&self) -> bool {
        // ---
        self.encoding.eq_ignore_ascii_case(TELEPHONE_EVENT)
    }

    pub fn is_dynamic(&self) -> bool {
        // ---
        (DYNAMIC_PT_MIN..=DYNAMIC_PT_MAX).contains(&self.payload_type)
    }

    /// Whether `other` describes the same encoding, ignoring payload number.
    pub fn matches(&self, other: &RtpFormat) -> bool {
        // ---
        self.encoding.eq_ignore_ascii_case(&other.encoding)
            && self.clock_rate == other.clock_rate
            && self.channels == other.channels
    }

    /// `a=rtpmap` value: `<pt> <encoding>/<rate>[/<channels>]`.
    pub fn rtpmap(&self) -> String {
        // ---
        if self.channels > 1 {
            format!(
                "{} {}/{}/{}",
                self.payload_type, self.encoding, self.clock_rate, self.channels
            )
        } else {
            format!("{} {}/{}", self.payload_type, self.encoding, self.clock_rate)
        }
    }
}

impl fmt::Display for RtpFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rtpmap())
    }
}

/// Ordered set of formats keyed by payload type.
///
/// Order is preference order; the first non-DTMF entry is the preferred
/// codec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtpFormats {
    formats: Vec<RtpFormat>,
}

impl RtpFormats {
    // ---
    pub fn new() -> Self {
        // ---
        Self::default()
    }

    /// Adds a format, replacing any entry with the same payload type in place.
    pub fn add(&mut self, format: RtpFormat) {
        // ---
        match self
            .formats
            .iter_mut()
            .find(|f| f.payload_type == format.payload_type)
        {
            Some(existing) => *existing = format,
            None => self.formats.push(format),
        }
    }

    pub fn remove(&mut self, payload_type: u8) -> Option<RtpFormat> {
        // ---
        let pos = self
            .formats
            .iter()
            .position(|f| f.payload_type == payload_type)?;
        Some(self.formats.remove(pos))
    }

    pub fn find(&self, payload_type: u8) -> Option<&RtpFormat> {
        // ---
        self.formats.iter().find(|f| f.payload_type == payload_type)
    }

    /// First entry describing the same encoding as `format`.
    pub fn find_matching(&self, format: &RtpFormat) -> Option<&RtpFormat> {
        // ---
        self.formats.iter().find(|f| f.matches(format))
    }

    pub fn contains_encoding(&self, format: &RtpFormat) -> bool {
        // ---
        self.find_matching(format).is_some()
    }

    /// Entries of `self` whose encoding also appears in `other`, keeping
    /// `self`'s order and payload numbers.
    pub fn intersection(&self, other: &RtpFormats) -> RtpFormats {
        // ---
        self.formats
            .iter()
            .filter(|f| other.contains_encoding(f))
            .cloned()
            .collect()
    }

    pub fn has_non_dtmf(&self) -> bool {
        // ---
        self.formats.iter().any(|f| !f.is_dtmf())
    }

    /// The preferred (first) non-DTMF format.
    pub fn media(&self) -> Option<&RtpFormat> {
        // ---
        self.formats.iter().find(|f| !f.is_dtmf())
    }

    /// The first telephone-event format.
    pub fn dtmf(&self) -> Option<&RtpFormat> {
        // ---
        self.formats.iter().find(|f| f.is_dtmf())
    }

    pub fn payload_types(&self) -> Vec<u8> {
        // ---
        self.formats.iter().map(|f| f.payload_type).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RtpFormat> {
        // ---
        self.formats.iter()
    }

    pub fn len(&self) -> usize {
        // ---
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.formats.is_empty()
    }

    pub fn clear(&mut self) {
        // ---
        self.formats.clear();
    }
}

impl FromIterator<RtpFormat> for RtpFormats {
    fn from_iter<I: IntoIterator<Item = RtpFormat>>(iter: I) -> Self {
        // ---
        let mut formats = RtpFormats::new();
        for format in iter {
            formats.add(format);
        }
        formats
    }
}

impl<'a> IntoIterator for &'a RtpFormats {
    type Item = &'a RtpFormat;
    type IntoIter = std::slice::Iter<'a, RtpFormat>;

    fn into_iter(self) -> Self::IntoIter {
        self.formats.iter()
    }
}

/// The RTP/AVP profile the gateway knows about.
///
/// Static payload types resolve through this table without an `a=rtpmap`
/// line. Dynamic entries here are the numbers the gateway itself offers.
pub struct AvProfile;

impl AvProfile {
    // ---
    pub fn audio() -> RtpFormats {
        // ---
        [
            RtpFormat::new(0, "PCMU", 8000),
            RtpFormat::new(3, "GSM", 8000),
            RtpFormat::new(8, "PCMA", 8000),
            RtpFormat::new(9, "G722", 8000),
            RtpFormat::new(18, "G729", 8000),
            RtpFormat::new(97, "iLBC", 8000),
            RtpFormat::new(DEFAULT_DTMF_PAYLOAD, TELEPHONE_EVENT, 8000),
        ]
        .into_iter()
        .collect()
    }

    pub fn video() -> RtpFormats {
        // ---
        [
            RtpFormat::new(34, "H263", 90000),
            RtpFormat::new(96, "H264", 90000),
            RtpFormat::new(100, "VP8", 90000),
        ]
        .into_iter()
        .collect()
    }

    pub fn for_media(media: MediaType) -> RtpFormats {
        // ---
        match media {
            MediaType::Audio => Self::audio(),
            MediaType::Video => Self::video(),
            MediaType::Application => RtpFormats::new(),
        }
    }

    /// Resolves a static payload type (below 96) for `media`.
    pub fn static_format(media: MediaType, payload_type: u8) -> Option<RtpFormat> {
        // ---
        if payload_type >= DYNAMIC_PT_MIN {
            return None;
        }
        Self::for_media(media).find(payload_type).cloned()
    }

    /// Looks up a profile entry by encoding name and clock rate.
    pub fn by_name(media: MediaType, encoding: &str, clock_rate: u32) -> Option<RtpFormat> {
        // ---
        Self::for_media(media)
            .iter()
            .find(|f| f.encoding.eq_ignore_ascii_case(encoding) && f.clock_rate == clock_rate)
            .cloned()
    }

    /// Default telephone-event format.
    pub fn dtmf() -> RtpFormat {
        // ---
        RtpFormat::new(DEFAULT_DTMF_PAYLOAD, TELEPHONE_EVENT, 8000)
    }
}
