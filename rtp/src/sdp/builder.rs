//! Builds local offers and answers from media session state.

use super::{
    Candidate, ConnectionField, Fingerprint, IceCredentials, MediaDescription, Origin,
    RtcpAttribute, SessionDescription, SetupRole, SsrcAttribute, RTP_AVP, RTP_SAVPF,
};
use crate::format::{MediaType, RtpFormats, DEFAULT_DTMF_PAYLOAD};
use mgw_common::ConnectionMode;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Session name written on every generated description.
pub const ORIGINATOR_NAME: &str = "Media Gateway";

/// Packetization time advertised on every media line, in milliseconds.
pub const PACKETIZATION_TIME: u32 = 20;

/// What one local media session contributes to a description.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    // ---
    pub media: MediaType,

    /// Bound RTP address
    pub rtp_address: SocketAddr,

    /// Bound RTCP address, None under rtcp-mux
    pub rtcp_address: Option<SocketAddr>,

    /// Offered or negotiated formats, in preference order
    pub formats: RtpFormats,

    pub mode: ConnectionMode,
    pub ssrc: u32,

    /// Local credentials when ICE-lite is in use
    pub ice: Option<IceCredentials>,

    /// Local certificate fingerprint when DTLS is in use
    pub dtls: Option<Fingerprint>,
}

/// Generates session descriptions for the gateway side of an exchange.
#[derive(Debug, Clone)]
pub struct SdpBuilder {
    // ---
    local_address: String,
    external_address: Option<String>,
}

impl SdpBuilder {
    // ---
    pub fn new(local_address: impl Into<String>, external_address: Option<String>) -> Self {
        // ---
        Self {
            local_address: local_address.into(),
            external_address: external_address.filter(|a| !a.is_empty()),
        }
    }

    /// External address when configured, otherwise `local`.
    fn resolve<'a>(&'a self, local: &'a str) -> &'a str {
        // ---
        self.external_address.as_deref().unwrap_or(local)
    }

    /// Builds a description with one `m=` section per session.
    ///
    /// Offers advertise only the default telephone-event payload; answers
    /// carry whatever was negotiated.
    pub fn build(&self, offer: bool, cname: &str, sessions: &[LocalMedia]) -> SessionDescription {
        // ---
        let session_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let origin_address = self.resolve(&self.local_address).to_string();

        let mut sdp = SessionDescription::new(
            Origin::new(session_id.to_string(), origin_address.clone()),
            ORIGINATOR_NAME,
        );
        sdp.connection = Some(ConnectionField::new(origin_address));

        for session in sessions {
            let md = self.build_media_description(offer, cname, session);
            if md.ice.is_some() {
                sdp.ice_lite = true;
            }
            sdp.media.push(md);
        }

        sdp
    }

    fn build_media_description(
        &self,
        offer: bool,
        cname: &str,
        session: &LocalMedia,
    ) -> MediaDescription {
        // ---
        let protocol = if session.dtls.is_some() { RTP_SAVPF } else { RTP_AVP };
        let mut md = MediaDescription::new(session.media, session.rtp_address.port(), protocol);

        let host = session.rtp_address.ip().to_string();
        md.connection = Some(ConnectionField::new(self.resolve(&host)));
        md.ptime = Some(PACKETIZATION_TIME);

        match session.rtcp_address {
            Some(rtcp) => {
                md.rtcp = Some(RtcpAttribute {
                    port: rtcp.port(),
                    address: None,
                })
            }
            None => md.rtcp_mux = true,
        }

        for format in &session.formats {
            if offer && format.is_dtmf() && format.payload_type != DEFAULT_DTMF_PAYLOAD {
                continue;
            }
            md.add_format(format);
        }

        if let Some(ice) = &session.ice {
            md.ice = Some(ice.clone());
            md.candidates.push(Candidate::host(1, session.rtp_address));
            if let Some(rtcp) = session.rtcp_address {
                md.candidates.push(Candidate::host(2, rtcp));
            }
        }

        if let Some(fingerprint) = &session.dtls {
            md.fingerprint = Some(fingerprint.clone());
            md.setup = Some(if offer {
                SetupRole::ActPass
            } else {
                SetupRole::Passive
            });
        }

        md.direction = Some(session.mode);
        md.ssrc = Some(SsrcAttribute {
            ssrc: session.ssrc,
            cname: Some(cname.to_string()),
        });

        md
    }

    /// Appends an RFC 3264 rejection (port 0) of `media` to `answer`.
    pub fn reject_media(&self, answer: &mut SessionDescription, media: &MediaDescription) {
        // ---
        answer.media.push(MediaDescription {
            media: media.media.clone(),
            port: 0,
            protocol: media.protocol.clone(),
            formats: media.formats.clone(),
            ..MediaDescription::default()
        });
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::format::{AvProfile, RtpFormat};

    fn local_audio(formats: RtpFormats) -> LocalMedia {
        LocalMedia {
            media: MediaType::Audio,
            rtp_address: "10.0.0.5:61000".parse().expect("addr"),
            rtcp_address: Some("10.0.0.5:61001".parse().expect("addr")),
            formats,
            mode: ConnectionMode::SendRecv,
            ssrc: 0xCAFE,
            ice: None,
            dtls: None,
        }
    }

    #[test]
    fn test_offer_has_required_lines() {
        // ---
        let builder = SdpBuilder::new("10.0.0.5", None);
        let sdp = builder.build(true, "cname123", &[local_audio(AvProfile::audio())]);
        let text = sdp.to_string();

        for prefix in ["v=0\r\n", "o=- ", "s=Media Gateway\r\n", "c=IN IP4 10.0.0.5\r\n", "t=0 0\r\n"] {
            assert!(text.contains(prefix), "missing {prefix:?} in {text}");
        }
        assert!(text.contains("m=audio 61000 RTP/AVP 0 3 8 9 18 97 101\r\n"));
        assert!(text.contains("a=rtcp:61001\r\n"));
        assert!(text.contains("a=ptime:20\r\n"));
        assert!(text.contains("a=ssrc:51966 cname:cname123\r\n"));
        assert!(!text.contains("ice-lite"));

        assert_eq!(SessionDescription::parse(&text).map(|s| s.media.len()), Ok(1));
    }

    #[test]
    fn test_offer_only_default_dtmf() {
        // ---
        let mut formats = AvProfile::audio();
        formats.add(RtpFormat::new(126, "telephone-event", 8000));

        let builder = SdpBuilder::new("10.0.0.5", None);
        let offer = builder.build(true, "c", &[local_audio(formats.clone())]);
        assert_eq!(offer.media[0].payload_types(), vec![0, 3, 8, 9, 18, 97, 101]);

        let answer = builder.build(false, "c", &[local_audio(formats)]);
        assert!(answer.media[0].payload_types().contains(&126));
    }

    #[test]
    fn test_external_address_wins() {
        // ---
        let builder = SdpBuilder::new("10.0.0.5", Some("203.0.113.1".to_string()));
        let sdp = builder.build(true, "c", &[local_audio(AvProfile::audio())]);

        assert_eq!(sdp.origin.address, "203.0.113.1");
        assert_eq!(
            sdp.media[0].connection.as_ref().map(|c| c.address.as_str()),
            Some("203.0.113.1")
        );
    }

    #[test]
    fn test_ice_and_dtls_answer() {
        // ---
        let mut media = local_audio(AvProfile::audio());
        media.rtcp_address = None;
        media.ice = Some(IceCredentials {
            ufrag: "u".into(),
            pwd: "p".into(),
        });
        media.dtls = Some(Fingerprint {
            hash: "sha-256".into(),
            value: "00:11".into(),
        });

        let sdp = SdpBuilder::new("10.0.0.5", None).build(false, "c", &[media]);
        let md = &sdp.media[0];

        assert!(sdp.ice_lite);
        assert!(md.rtcp_mux);
        assert_eq!(md.candidates.len(), 1);
        assert_eq!(md.setup, Some(SetupRole::Passive));
        assert_eq!(md.protocol, RTP_SAVPF);
        assert!(sdp.to_string().contains("a=ice-lite\r\n"));
    }

    #[test]
    fn test_reject_media() {
        // ---
        let offer = "v=0\r\no=- 1 1 IN IP4 1.2.3.4\r\ns=-\r\nt=0 0\r\nm=video 5000 RTP/AVP 96\r\n";
        let remote = SessionDescription::parse(offer).expect("parses");

        let builder = SdpBuilder::new("10.0.0.5", None);
        let mut answer = builder.build(false, "c", &[]);
        builder.reject_media(&mut answer, &remote.media[0]);

        assert!(answer.to_string().contains("m=video 0 RTP/AVP 96\r\n"));
    }
}
