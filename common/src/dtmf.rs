//! RFC 2833 / RFC 4733 telephone-event payload.

use crate::rtp::PacketError;

/// Telephone-event payload length in bytes.
pub const DTMF_PAYLOAD_LEN: usize = 4;

/// One named telephone event.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     event     |E|R| volume    |          duration             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfEvent {
    // ---
    /// Event code (0-9, 10 = `*`, 11 = `#`, 12-15 = A-D)
    pub event: u8,

    /// Set on the final packets of the event
    pub end: bool,

    /// Power level in -dBm0 (0..=63)
    pub volume: u8,

    /// Duration in timestamp units since the event started
    pub duration: u16,
}

impl DtmfEvent {
    // ---
    pub fn new(event: u8, end: bool, volume: u8, duration: u16) -> Self {
        // ---
        Self {
            event,
            end,
            volume: volume & 0x3F,
            duration,
        }
    }

    pub fn serialize(&self) -> [u8; DTMF_PAYLOAD_LEN] {
        // ---
        let duration = self.duration.to_be_bytes();
        [
            self.event,
            ((self.end as u8) << 7) | (self.volume & 0x3F),
            duration[0],
            duration[1],
        ]
    }

    pub fn deserialize(payload: &[u8]) -> Result<Self, PacketError> {
        // ---
        if payload.len() < DTMF_PAYLOAD_LEN {
            return Err(PacketError::TooShort(payload.len()));
        }

        Ok(Self {
            event: payload[0],
            end: payload[1] & 0x80 != 0,
            volume: payload[1] & 0x3F,
            duration: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }

    /// Maps the event code to its keypad symbol, if it is a DTMF digit.
    pub fn symbol(&self) -> Option<char> {
        // ---
        match self.event {
            0..=9 => Some((b'0' + self.event) as char),
            10 => Some('*'),
            11 => Some('#'),
            12..=15 => Some((b'A' + self.event - 12) as char),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_end_flag_and_volume_share_a_byte() {
        // ---
        let bytes = DtmfEvent::new(11, true, 10, 800).serialize();
        assert_eq!(bytes, [11, 0x80 | 10, 0x03, 0x20]);

        let event = DtmfEvent::deserialize(&bytes).expect("decode failed");
        assert!(event.end);
        assert_eq!(event.volume, 10);
        assert_eq!(event.duration, 800);
        assert_eq!(event.symbol(), Some('#'));
    }

    #[test]
    fn test_short_payload_rejected() {
        // ---
        assert_eq!(DtmfEvent::deserialize(&[1, 2]), Err(PacketError::TooShort(2)));
    }

    #[test]
    fn test_symbols() {
        // ---
        assert_eq!(DtmfEvent::new(5, false, 0, 0).symbol(), Some('5'));
        assert_eq!(DtmfEvent::new(10, false, 0, 0).symbol(), Some('*'));
        assert_eq!(DtmfEvent::new(15, false, 0, 0).symbol(), Some('D'));
        assert_eq!(DtmfEvent::new(16, false, 0, 0).symbol(), None);
    }
}
