//! RTP packet structure and serialization.
//!
//! Implements the RFC 3550 fixed header. CSRC lists and header extensions
//! are skipped on parse and never emitted; padding is stripped.

use thiserror::Error;

/// RTP packet version 2 (as per RFC 3550)
const RTP_VERSION: u8 = 2;

/// Fixed header length in bytes.
pub const RTP_HEADER_LEN: usize = 12;

/// Errors raised while decoding wire packets.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too small: {0} bytes")]
    TooShort(usize),

    #[error("invalid RTP version: {0}")]
    InvalidVersion(u8),

    #[error("header overruns packet: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("invalid padding length {0}")]
    InvalidPadding(u8),
}

/// RTP packet as carried between a media session and the network.
///
/// # Protocol Details
///
/// - Version: Always 2 (RFC 3550)
/// - Marker: set on the first packet of a talkspurt or the end of a DTMF event
/// - Payload Type: 7 bits, resolved against the negotiated format table
/// - Sequence: Increments by 1 for each packet, wraps at 65536
/// - Timestamp: Sampling instant in clock-rate units
/// - SSRC: Synchronization source identifier (random per session)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    // ---
    /// Marker bit
    pub marker: bool,

    /// Payload type (0..=127)
    pub payload_type: u8,

    /// Packet sequence number (wraps at 65535)
    pub sequence: u16,

    /// RTP timestamp in sample units
    pub timestamp: u32,

    /// Synchronization source identifier
    pub ssrc: u32,

    /// Media payload
    pub payload: Vec<u8>,
}

impl RtpPacket {
    // ---
    /// Creates a packet without the marker bit.
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, payload: Vec<u8>) -> Self {
        // ---
        Self {
            marker: false,
            payload_type: payload_type & 0x7F,
            sequence,
            timestamp,
            ssrc,
            payload,
        }
    }

    /// Sets the marker bit.
    pub fn with_marker(mut self, marker: bool) -> Self {
        // ---
        self.marker = marker;
        self
    }

    /// Serializes the RTP packet into wire format.
    ///
    /// # Wire Format
    ///
    /// ```text
    ///  0                   1                   2                   3
    ///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                           timestamp                           |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |           synchronization source (SSRC) identifier            |
    /// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
    /// |                           payload...                          |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    pub fn serialize(&self) -> Vec<u8> {
        // ---
        let mut buf = Vec::with_capacity(RTP_HEADER_LEN + self.payload.len());

        // V=2, P=0, X=0, CC=0
        buf.push(RTP_VERSION << 6);
        buf.push(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Deserializes an RTP packet from wire format.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Packet is smaller than minimum header size (12 bytes)
    /// - RTP version is not 2
    /// - CSRC list or extension header runs past the end of the packet
    /// - Padding length is zero or larger than the remaining payload
    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        // ---
        if data.len() < RTP_HEADER_LEN {
            return Err(PacketError::TooShort(data.len()));
        }

        let version = (data[0] >> 6) & 0x03;
        if version != RTP_VERSION {
            return Err(PacketError::InvalidVersion(version));
        }

        let has_padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0F) as usize;

        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7F;
        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = RTP_HEADER_LEN + csrc_count * 4;
        if has_extension {
            if data.len() < offset + 4 {
                return Err(PacketError::Truncated {
                    needed: offset + 4,
                    available: data.len(),
                });
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + words * 4;
        }
        if data.len() < offset {
            return Err(PacketError::Truncated {
                needed: offset,
                available: data.len(),
            });
        }

        let mut end = data.len();
        if has_padding {
            let pad = data[end - 1];
            if pad == 0 || (pad as usize) > end - offset {
                return Err(PacketError::InvalidPadding(pad));
            }
            end -= pad as usize;
        }

        Ok(Self {
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            payload: data[offset..end].to_vec(),
        })
    }

    /// Returns true when the first byte looks like RTCP (payload types 200..=204
    /// in the second byte, RFC 5761 demultiplexing rule).
    pub fn is_rtcp(data: &[u8]) -> bool {
        // ---
        data.len() >= 2 && (192..=223).contains(&data[1])
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_rtp_packet_serialization() {
        // ---
        let packet = RtpPacket::new(8, 100, 32000, 0x12345678, vec![1, 2, 3, 4]).with_marker(true);
        let serialized = packet.serialize();

        assert_eq!(serialized[0] >> 6, 2); // Version
        assert_eq!(serialized[1] & 0x80, 0x80); // Marker
        assert_eq!(serialized[1] & 0x7F, 8); // Payload type
        assert_eq!(u16::from_be_bytes([serialized[2], serialized[3]]), 100);
        assert_eq!(&serialized[12..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_rtp_packet_deserialization() {
        // ---
        let packet = RtpPacket::new(0, 200, 64000, 0xAABBCCDD, vec![5, 6, 7, 8]);
        let deserialized = RtpPacket::deserialize(&packet.serialize()).expect("deserialization failed");

        assert_eq!(deserialized, packet);
    }

    #[test]
    fn test_rtp_packet_too_small() {
        // ---
        let result = RtpPacket::deserialize(&[0, 1, 2]);
        assert_eq!(result, Err(PacketError::TooShort(3)));
    }

    #[test]
    fn test_rtp_invalid_version() {
        // ---
        let mut data = vec![0; 12];
        data[0] = 1 << 6;

        assert_eq!(RtpPacket::deserialize(&data), Err(PacketError::InvalidVersion(1)));
    }

    #[test]
    fn test_csrc_and_extension_are_skipped() {
        // ---
        let mut data = vec![0x80 | 0x10 | 0x01, 0, 0, 7, 0, 0, 0, 160, 0, 0, 0, 1];
        data.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]); // one CSRC
        data.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01]); // extension header, 1 word
        data.extend_from_slice(&[1, 2, 3, 4]); // extension body
        data.extend_from_slice(&[9, 9]); // payload

        let packet = RtpPacket::deserialize(&data).expect("deserialization failed");
        assert_eq!(packet.sequence, 7);
        assert_eq!(packet.payload, vec![9, 9]);
    }

    #[test]
    fn test_padding_is_stripped() {
        // ---
        let mut data = RtpPacket::new(0, 1, 0, 0, vec![1, 2, 3]).serialize();
        data[0] |= 0x20;
        data.extend_from_slice(&[0, 0, 3]);

        let packet = RtpPacket::deserialize(&data).expect("deserialization failed");
        assert_eq!(packet.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_rtcp_demux() {
        // ---
        assert!(RtpPacket::is_rtcp(&[0x80, 200, 0, 6]));
        assert!(!RtpPacket::is_rtcp(&RtpPacket::new(8, 1, 0, 0, vec![]).serialize()));
    }
}
