//! Offer/answer format negotiation.
//!
//! Selects at most one media format plus at most one telephone-event format
//! from what the remote offered, restricted to what the gateway can both
//! receive and transmit. Payload numbers follow the remote side.

use crate::error::NegotiationError;
use crate::format::{AvProfile, MediaType, RtpFormat, RtpFormats};
use crate::sdp::MediaDescription;
use tracing::debug;

/// Resolves the payload list of an `m=` line into formats.
///
/// `a=rtpmap` wins when present. Static payload types fall back to the AV
/// profile. Anything else is dropped.
pub fn offered_formats(md: &MediaDescription) -> RtpFormats {
    // ---
    let media = md.media_type().unwrap_or(MediaType::Application);
    let mut formats = RtpFormats::new();

    for pt in md.payload_types() {
        match md
            .rtpmap(pt)
            .or_else(|| AvProfile::static_format(media, pt))
        {
            Some(format) => formats.add(format),
            None => debug!("Dropping unsupported payload type: media={} pt={}", media, pt),
        }
    }

    formats
}

/// Local receive and transmit capabilities for one media type.
#[derive(Debug, Clone)]
pub struct FormatNegotiator {
    // ---
    media: MediaType,
    rx: RtpFormats,
    tx: RtpFormats,
}

impl FormatNegotiator {
    // ---
    /// `telephone-event/8000` is added to both directions if missing.
    pub fn new(media: MediaType, mut rx: RtpFormats, mut tx: RtpFormats) -> Self {
        // ---
        if media == MediaType::Audio {
            let dtmf = AvProfile::dtmf();
            if !rx.contains_encoding(&dtmf) {
                rx.add(dtmf.clone());
            }
            if !tx.contains_encoding(&dtmf) {
                tx.add(dtmf);
            }
        }
        Self { media, rx, tx }
    }

    /// Same capabilities in both directions.
    pub fn symmetric(media: MediaType, formats: RtpFormats) -> Self {
        // ---
        Self::new(media, formats.clone(), formats)
    }

    pub fn media(&self) -> MediaType {
        // ---
        self.media
    }

    /// What this side can do in both directions, in rx preference order.
    pub fn supported(&self) -> RtpFormats {
        // ---
        self.rx.intersection(&self.tx)
    }

    /// Negotiates against a remote media description.
    ///
    /// # Errors
    ///
    /// Returns `NegotiationError::CodecsNotNegotiated` when no non-DTMF
    /// format is common to the remote list and local capabilities.
    pub fn negotiate(&self, md: &MediaDescription) -> Result<RtpFormats, NegotiationError> {
        // ---
        self.select(&offered_formats(md))
    }

    /// Picks the first acceptable media format and the first acceptable
    /// DTMF format from `offered`, in offer order.
    pub fn select(&self, offered: &RtpFormats) -> Result<RtpFormats, NegotiationError> {
        // ---
        let supported = self.supported();
        let mut media: Option<RtpFormat> = None;
        let mut dtmf: Option<RtpFormat> = None;

        for format in offered {
            if !supported.contains_encoding(format) {
                continue;
            }
            if format.is_dtmf() {
                dtmf.get_or_insert_with(|| format.clone());
            } else {
                media.get_or_insert_with(|| format.clone());
            }
            if media.is_some() && dtmf.is_some() {
                break;
            }
        }

        let Some(media) = media else {
            return Err(NegotiationError::CodecsNotNegotiated(self.media));
        };

        let mut negotiated = RtpFormats::new();
        negotiated.add(media);
        if let Some(dtmf) = dtmf {
            negotiated.add(dtmf);
        }
        debug!(
            "Negotiated {} formats: {:?}",
            self.media,
            negotiated.payload_types()
        );
        Ok(negotiated)
    }
}
