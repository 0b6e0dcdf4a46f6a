//! Line-oriented SDP parser.

use super::{
    Attribute, Candidate, ConnectionField, Fingerprint, IceCredentials, MediaDescription, Origin,
    RtcpAttribute, SessionDescription, SsrcAttribute,
};
use crate::error::SdpError;
use crate::format::RtpFormat;
use mgw_common::ConnectionMode;
use std::str::FromStr;

fn malformed(field: char, line: &str) -> SdpError {
    // ---
    SdpError::Malformed {
        field,
        line: line.to_string(),
    }
}

fn number<T: FromStr>(field: char, token: &str, line: &str) -> Result<T, SdpError> {
    // ---
    token.trim().parse().map_err(|_| malformed(field, line))
}

/// Session-level fields collected before the first `m=` line.
#[derive(Default)]
struct SessionFields {
    version: Option<u8>,
    origin: Option<Origin>,
    session_name: Option<String>,
    timing: Option<(u64, u64)>,
}

/// Where attribute lines currently land.
enum Scope<'a> {
    Session(&'a mut SessionDescription),
    Media(&'a mut MediaDescription),
}

pub(super) fn parse(text: &str) -> Result<SessionDescription, SdpError> {
    // ---
    let mut fields = SessionFields::default();
    let mut sdp = SessionDescription::new(Origin::new("0", "0.0.0.0"), "-");

    for raw in text.lines() {
        let line = raw.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }

        let bytes = line.as_bytes();
        if bytes.len() < 2 || bytes[1] != b'=' {
            return Err(malformed(line.chars().next().unwrap_or('?'), line));
        }
        let kind = bytes[0] as char;
        let value = &line[2..];

        match kind {
            'v' => fields.version = Some(number('v', value, line)?),
            'o' => fields.origin = Some(parse_origin(value, line)?),
            's' => fields.session_name = Some(value.to_string()),
            't' => fields.timing = Some(parse_timing(value, line)?),
            'm' => sdp.media.push(parse_media_line(value, line)?),
            'c' => {
                let connection = parse_connection(value, line)?;
                match sdp.media.last_mut() {
                    Some(md) => md.connection = Some(connection),
                    None => sdp.connection = Some(connection),
                }
            }
            'a' => {
                match sdp.media.last_mut() {
                    Some(md) => parse_attribute(Scope::Media(md), value, line)?,
                    None => parse_attribute(Scope::Session(&mut sdp), value, line)?,
                }
            }
            // b=, i=, u=, e=, p=, z=, k=, r= carry nothing the gateway acts on
            _ => {}
        }
    }

    sdp.version = fields.version.ok_or(SdpError::MissingField('v'))?;
    sdp.origin = fields.origin.ok_or(SdpError::MissingField('o'))?;
    sdp.session_name = fields.session_name.ok_or(SdpError::MissingField('s'))?;
    sdp.timing = fields.timing.ok_or(SdpError::MissingField('t'))?;
    Ok(sdp)
}

fn parse_origin(value: &str, line: &str) -> Result<Origin, SdpError> {
    // ---
    let tokens: Vec<&str> = value.split_whitespace().collect();
    if tokens.len() != 6 {
        return Err(malformed('o', line));
    }
    Ok(Origin {
        username: tokens[0].to_string(),
        session_id: tokens[1].to_string(),
        session_version: tokens[2].to_string(),
        address_type: tokens[4].to_string(),
        address: tokens[5].to_string(),
    })
}

fn parse_timing(value: &str, line: &str) -> Result<(u64, u64), SdpError> {
    // ---
    let mut tokens = value.split_whitespace();
    match (tokens.next(), tokens.next()) {
        (Some(start), Some(stop)) => Ok((number('t', start, line)?, number('t', stop, line)?)),
        _ => Err(malformed('t', line)),
    }
}

fn parse_connection(value: &str, line: &str) -> Result<ConnectionField, SdpError> {
    // ---
    let tokens: Vec<&str> = value.split_whitespace().collect();
    if tokens.len() != 3 || tokens[0] != "IN" {
        return Err(malformed('c', line));
    }
    // Multicast addresses may carry /ttl[/count]
    let address = tokens[2].split('/').next().unwrap_or(tokens[2]);
    Ok(ConnectionField {
        address_type: tokens[1].to_string(),
        address: address.to_string(),
    })
}

fn parse_media_line(value: &str, line: &str) -> Result<MediaDescription, SdpError> {
    // ---
    let tokens: Vec<&str> = value.split_whitespace().collect();
    if tokens.len() < 3 {
        return Err(malformed('m', line));
    }
    let port = tokens[1].split('/').next().unwrap_or(tokens[1]);
    Ok(MediaDescription {
        media: tokens[0].to_string(),
        port: number('m', port, line)?,
        protocol: tokens[2].to_string(),
        formats: tokens[3..].iter().map(|t| t.to_string()).collect(),
        ..MediaDescription::default()
    })
}

fn parse_rtpmap(value: &str, line: &str) -> Result<RtpFormat, SdpError> {
    // ---
    let (pt, encoding) = value.split_once(' ').ok_or_else(|| malformed('a', line))?;
    let mut parts = encoding.trim().split('/');
    let name = parts.next().filter(|n| !n.is_empty()).ok_or_else(|| malformed('a', line))?;
    let clock_rate = parts
        .next()
        .ok_or_else(|| malformed('a', line))
        .and_then(|r| number('a', r, line))?;
    let channels = match parts.next() {
        Some(c) => number('a', c, line)?,
        None => 1,
    };

    Ok(RtpFormat::new(number('a', pt, line)?, name, clock_rate).with_channels(channels))
}

fn parse_candidate(value: &str, line: &str) -> Result<Candidate, SdpError> {
    // ---
    let tokens: Vec<&str> = value.split_whitespace().collect();
    if tokens.len() < 8 || tokens[6] != "typ" {
        return Err(malformed('a', line));
    }
    Ok(Candidate {
        foundation: tokens[0].to_string(),
        component: number('a', tokens[1], line)?,
        transport: tokens[2].to_ascii_lowercase(),
        priority: number('a', tokens[3], line)?,
        address: tokens[4].to_string(),
        port: number('a', tokens[5], line)?,
        kind: tokens[7].to_string(),
    })
}

fn parse_rtcp(value: &str, line: &str) -> Result<RtcpAttribute, SdpError> {
    // ---
    let tokens: Vec<&str> = value.split_whitespace().collect();
    let port = tokens.first().ok_or_else(|| malformed('a', line))?;
    Ok(RtcpAttribute {
        port: number('a', port, line)?,
        address: tokens.get(3).map(|a| a.to_string()),
    })
}

fn parse_ssrc(value: &str, line: &str) -> Result<(u32, Option<String>), SdpError> {
    // ---
    let (id, rest) = match value.split_once(' ') {
        Some((id, rest)) => (id, Some(rest)),
        None => (value, None),
    };
    let cname = rest
        .and_then(|r| r.trim().strip_prefix("cname:"))
        .map(|c| c.to_string());
    Ok((number('a', id, line)?, cname))
}

fn parse_attribute(scope: Scope<'_>, value: &str, line: &str) -> Result<(), SdpError> {
    // ---
    let (name, arg) = match value.split_once(':') {
        Some((name, arg)) => (name, Some(arg)),
        None => (value, None),
    };

    if let Ok(direction) = name.parse::<ConnectionMode>() {
        if arg.is_none() && !name.contains('_') {
            match scope {
                Scope::Session(sdp) => sdp.direction = Some(direction),
                Scope::Media(md) => md.direction = Some(direction),
            }
            return Ok(());
        }
    }

    match (scope, name, arg) {
        (Scope::Session(sdp), "ice-lite", None) => sdp.ice_lite = true,
        (Scope::Session(sdp), "ice-ufrag", Some(ufrag)) => {
            ice_slot(&mut sdp.ice).ufrag = ufrag.trim().to_string()
        }
        (Scope::Session(sdp), "ice-pwd", Some(pwd)) => ice_slot(&mut sdp.ice).pwd = pwd.trim().to_string(),
        (Scope::Session(sdp), "fingerprint", Some(fp)) => sdp.fingerprint = Some(fp.parse()?),
        (Scope::Session(sdp), "setup", Some(role)) => sdp.setup = Some(role.parse()?),
        (Scope::Session(sdp), _, _) => sdp.attributes.push(other(name, arg)),

        (Scope::Media(md), "rtpmap", Some(map)) => {
            let format = parse_rtpmap(map, line)?;
            md.rtpmaps.retain(|f| f.payload_type != format.payload_type);
            md.rtpmaps.push(format);
        }
        (Scope::Media(md), "fmtp", Some(fmtp)) => {
            let (pt, params) = fmtp.split_once(' ').ok_or_else(|| malformed('a', line))?;
            md.fmtps.insert(number('a', pt, line)?, params.trim().to_string());
        }
        (Scope::Media(md), "ptime", Some(ptime)) => md.ptime = Some(number('a', ptime, line)?),
        (Scope::Media(md), "rtcp", Some(rtcp)) => md.rtcp = Some(parse_rtcp(rtcp, line)?),
        (Scope::Media(md), "rtcp-mux", None) => md.rtcp_mux = true,
        (Scope::Media(md), "ice-ufrag", Some(ufrag)) => {
            ice_slot(&mut md.ice).ufrag = ufrag.trim().to_string()
        }
        (Scope::Media(md), "ice-pwd", Some(pwd)) => ice_slot(&mut md.ice).pwd = pwd.trim().to_string(),
        (Scope::Media(md), "candidate", Some(candidate)) => {
            md.candidates.push(parse_candidate(candidate, line)?)
        }
        (Scope::Media(md), "fingerprint", Some(fp)) => md.fingerprint = Some(Fingerprint::from_str(fp)?),
        (Scope::Media(md), "setup", Some(role)) => md.setup = Some(role.parse()?),
        (Scope::Media(md), "ssrc", Some(ssrc)) => {
            let (id, cname) = parse_ssrc(ssrc, line)?;
            match &mut md.ssrc {
                Some(existing) if existing.ssrc == id => {
                    if existing.cname.is_none() {
                        existing.cname = cname;
                    }
                }
                Some(_) => {}
                None => md.ssrc = Some(SsrcAttribute { ssrc: id, cname }),
            }
        }
        (Scope::Media(md), _, _) => md.attributes.push(other(name, arg)),
    }
    Ok(())
}

fn ice_slot(slot: &mut Option<IceCredentials>) -> &mut IceCredentials {
    // ---
    slot.get_or_insert_with(|| IceCredentials {
        ufrag: String::new(),
        pwd: String::new(),
    })
}

fn other(name: &str, arg: Option<&str>) -> Attribute {
    // ---
    Attribute {
        name: name.to_string(),
        value: arg.map(|a| a.to_string()),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::format::MediaType;

    const WEBRTC_OFFER: &str = "v=0
o=mozilla...THIS_IS_SDPARTA 4294967296 0 IN IP4 0.0.0.0
s=-
t=0 0
a=fingerprint:sha-256 AB:CD:EF
a=ice-options:trickle
m=audio 9 UDP/TLS/RTP/SAVPF 109 0 8 101
c=IN IP4 203.0.113.7
a=candidate:0 1 UDP 2122252543 203.0.113.7 53412 typ host
a=ice-ufrag:f00d
a=ice-pwd:5ecret
a=rtcp-mux
a=setup:actpass
a=rtpmap:109 opus/48000/2
a=fmtp:109 maxplaybackrate=48000;stereo=1
a=rtpmap:101 telephone-event/8000
a=ssrc:12345 cname:{abc}
a=ssrc:12345 msid:stream track
a=sendrecv
a=mid:0
";

    #[test]
    fn test_parses_webrtc_offer() {
        // ---
        let sdp = SessionDescription::parse(WEBRTC_OFFER).expect("offer parses");

        assert!(sdp.contains_ice());
        assert!(sdp.contains_dtls());
        assert_eq!(sdp.attributes.len(), 1);

        let md = sdp.media_description(MediaType::Audio).expect("audio present");
        assert_eq!(md.payload_types(), vec![109, 0, 8, 101]);
        assert!(md.rtcp_mux);
        assert_eq!(md.candidates[0].port, 53412);
        assert_eq!(md.candidates[0].transport, "udp");
        assert_eq!(md.ice.as_ref().map(|i| i.pwd.as_str()), Some("5ecret"));
        assert_eq!(md.rtpmap(109).map(|f| f.channels), Some(2));
        assert_eq!(
            md.ssrc,
            Some(SsrcAttribute {
                ssrc: 12345,
                cname: Some("{abc}".to_string())
            })
        );
        assert_eq!(md.direction, Some(ConnectionMode::SendRecv));
        assert_eq!(md.attributes.len(), 1);
    }

    #[test]
    fn test_missing_required_fields() {
        // ---
        let no_origin = "v=0\r\ns=x\r\nt=0 0\r\n";
        assert_eq!(SessionDescription::parse(no_origin), Err(SdpError::MissingField('o')));

        let no_timing = "v=0\r\no=- 1 1 IN IP4 1.2.3.4\r\ns=x\r\n";
        assert_eq!(SessionDescription::parse(no_timing), Err(SdpError::MissingField('t')));
    }

    #[test]
    fn test_malformed_lines() {
        // ---
        let bad_port = "v=0\no=- 1 1 IN IP4 1.2.3.4\ns=x\nt=0 0\nm=audio x RTP/AVP 0\n";
        assert!(matches!(
            SessionDescription::parse(bad_port),
            Err(SdpError::Malformed { field: 'm', .. })
        ));

        let garbage = "v=0\nthis is not sdp\n";
        assert!(matches!(
            SessionDescription::parse(garbage),
            Err(SdpError::Malformed { field: 't', .. })
        ));
    }

    #[test]
    fn test_session_level_direction_and_connection() {
        // ---
        let text = "v=0\no=- 1 1 IN IP4 1.2.3.4\ns=x\nc=IN IP4 198.51.100.1/127\nt=0 0\na=recvonly\nm=audio 4000 RTP/AVP 0\n";
        let sdp = SessionDescription::parse(text).expect("parses");
        let md = &sdp.media[0];

        assert_eq!(sdp.effective_direction(md), ConnectionMode::RecvOnly);
        assert_eq!(
            sdp.effective_connection(md).map(|c| c.address.as_str()),
            Some("198.51.100.1")
        );
    }
}
