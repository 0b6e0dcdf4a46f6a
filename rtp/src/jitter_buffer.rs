//! Jitter buffer for RTP packet reordering and delay compensation.
//!
//! Implements a fixed-delay jitter buffer: every packet is held for the
//! configured tolerance after its arrival and then played out in sequence
//! order. Gaps are not waited for. A packet that shows up after its
//! successor has already been played is dropped and counted.
//!
//! The buffer also keeps the RFC 3550 A.8 interarrival jitter estimate.

use crate::clock::RtpClock;
use crate::format::{RtpFormat, RtpFormats};
use mgw_common::RtpPacket;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// Jitter buffer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitterBufferConfig {
    // ---
    /// Playout delay applied to every packet, in milliseconds
    pub tolerance_ms: u32,

    /// Maximum packets to buffer before the oldest is dropped
    pub max_packets: usize,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        // ---
        Self {
            tolerance_ms: 60, // 3 frames @ 20ms
            max_packets: 10,
        }
    }
}

/// What happened to a written packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Queued for playout
    Accepted,

    /// Same sequence number already queued
    Duplicate,

    /// Queued, but the oldest packet was dropped to make room
    Overflow,

    /// At or behind the playout pointer; counted as dropped
    Late,

    /// Payload type missing from the format map
    UnknownPayload,
}

/// Decodable unit handed to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    // ---
    pub sequence: u16,

    /// RTP timestamp converted to milliseconds
    pub timestamp_ms: u64,

    pub rtp_timestamp: u32,

    /// Distance to the next queued frame, or the last known duration
    pub duration_ms: u64,

    pub marker: bool,
    pub ssrc: u32,
    pub payload: Vec<u8>,
    pub format: RtpFormat,
}

impl Frame {
    // ---
    pub fn is_dtmf(&self) -> bool {
        // ---
        self.format.is_dtmf()
    }
}

/// Buffered packet with arrival timestamp.
#[derive(Debug, Clone)]
struct BufferedPacket {
    packet: RtpPacket,
    arrival_ms: u64,
    format: RtpFormat,
}

/// Jitter buffer status for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitterBufferStatus {
    pub buffered_packets: usize,
    pub last_delivered: Option<u16>,
    pub dropped: u64,
    pub jitter: u32,
}

/// Reorder and pacing buffer for one inbound stream.
///
/// # Example
///
/// ```
/// use mgw_rtp::clock::{ManualClock, RtpClock};
/// use mgw_rtp::format::RtpFormat;
/// use mgw_rtp::jitter_buffer::{JitterBuffer, JitterBufferConfig};
/// use mgw_common::RtpPacket;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let wall = Arc::new(ManualClock::new());
/// let clock = Arc::new(RtpClock::new(wall.clone()));
/// let mut buffer = JitterBuffer::new(JitterBufferConfig::default(), clock);
/// let pcmu = RtpFormat::new(0, "PCMU", 8000);
///
/// buffer.write(RtpPacket::new(0, 2, 160, 1, vec![0; 160]), &pcmu);
/// buffer.write(RtpPacket::new(0, 1, 0, 1, vec![0; 160]), &pcmu);
///
/// wall.advance(Duration::from_millis(60));
/// assert_eq!(buffer.read(60).map(|f| f.sequence), Some(1));
/// assert_eq!(buffer.read(60).map(|f| f.sequence), Some(2));
/// ```
#[derive(Debug)]
pub struct JitterBuffer {
    // ---
    config: JitterBufferConfig,
    clock: Arc<RtpClock>,

    /// Buffered packets sorted by sequence number
    queue: VecDeque<BufferedPacket>,

    /// Payload type to format map used by `write_mapped`
    formats: RtpFormats,

    /// Sequence number of the last frame played out (or skipped)
    last_delivered: Option<u16>,

    dropped: u64,

    /// Previous relative transit time, None until the first packet
    transit: Option<i32>,

    /// Jitter estimate scaled by 16
    jitter: u32,

    last_duration_ms: u64,

    /// Late packets seen in a row
    late_run: usize,
}

/// Signed distance from `b` to `a` in 16-bit sequence space.
fn sequence_delta(a: u16, b: u16) -> i16 {
    // ---
    a.wrapping_sub(b) as i16
}

impl JitterBuffer {
    // ---
    /// Creates a new jitter buffer driven by `clock`.
    pub fn new(config: JitterBufferConfig, clock: Arc<RtpClock>) -> Self {
        // ---
        Self {
            config,
            clock,
            queue: VecDeque::new(),
            formats: RtpFormats::new(),
            last_delivered: None,
            dropped: 0,
            transit: None,
            jitter: 0,
            last_duration_ms: 0,
            late_run: 0,
        }
    }

    pub fn config(&self) -> &JitterBufferConfig {
        // ---
        &self.config
    }

    pub fn clock(&self) -> &Arc<RtpClock> {
        // ---
        &self.clock
    }

    /// Installs the negotiated payload map.
    pub fn set_formats(&mut self, formats: RtpFormats) {
        // ---
        self.formats = formats;
    }

    pub fn formats(&self) -> &RtpFormats {
        // ---
        &self.formats
    }

    /// Writes a packet resolved through the installed format map.
    pub fn write_mapped(&mut self, packet: RtpPacket) -> WriteOutcome {
        // ---
        match self.formats.find(packet.payload_type).cloned() {
            Some(format) => self.write(packet, &format),
            None => {
                debug!(
                    "Discarding packet with unknown payload type: pt={} seq={}",
                    packet.payload_type, packet.sequence
                );
                WriteOutcome::UnknownPayload
            }
        }
    }

    /// Inserts a packet decoded as `format`.
    ///
    /// Every packet feeds the jitter estimate. Packets at or behind the
    /// playout pointer are dropped and counted, duplicates are ignored. When
    /// the queue exceeds `max_packets` the oldest entry is dropped.
    ///
    /// After `max_packets / 2` late packets in a row the stream is taken to
    /// have restarted: the queue is flushed (and counted as dropped) and the
    /// next packet starts a new playout sequence.
    pub fn write(&mut self, packet: RtpPacket, format: &RtpFormat) -> WriteOutcome {
        // ---
        // Events may run on their own rate; media owns the clock
        if !format.is_dtmf() {
            self.clock.set_clock_rate(format.clock_rate);
        }
        self.update_jitter(packet.timestamp);

        if let Some(last) = self.last_delivered {
            if sequence_delta(packet.sequence, last) <= 0 {
                self.dropped += 1;
                self.late_run += 1;
                warn!(
                    "Discarding late packet: seq={} (last played={})",
                    packet.sequence, last
                );
                if self.late_run >= self.resync_after() {
                    self.resynchronize();
                }
                return WriteOutcome::Late;
            }
        }
        self.late_run = 0;

        if self
            .queue
            .iter()
            .any(|bp| bp.packet.sequence == packet.sequence)
        {
            debug!("Discarding duplicate packet: seq={}", packet.sequence);
            return WriteOutcome::Duplicate;
        }

        let insert_pos = self
            .queue
            .iter()
            .position(|bp| sequence_delta(packet.sequence, bp.packet.sequence) < 0)
            .unwrap_or(self.queue.len());

        self.queue.insert(
            insert_pos,
            BufferedPacket {
                packet,
                arrival_ms: self.clock.wall_millis(),
                format: format.clone(),
            },
        );

        if self.queue.len() > self.config.max_packets {
            if let Some(oldest) = self.queue.pop_front() {
                warn!(
                    "Buffer overflow, dropping oldest packet: seq={}",
                    oldest.packet.sequence
                );
                self.last_delivered = Some(oldest.packet.sequence);
                self.dropped += 1;
                return WriteOutcome::Overflow;
            }
        }

        WriteOutcome::Accepted
    }

    fn resync_after(&self) -> usize {
        // ---
        (self.config.max_packets / 2).max(1)
    }

    /// Forgets the playout position after a run of late packets.
    fn resynchronize(&mut self) {
        // ---
        warn!(
            "{} late packets in a row, resynchronizing playout (flushing {} queued)",
            self.late_run,
            self.queue.len()
        );
        self.dropped += self.queue.len() as u64;
        self.queue.clear();
        self.last_delivered = None;
        self.late_run = 0;
        self.transit = None;
        self.jitter = 0;
        self.clock.reset();
    }

    /// RFC 3550 A.8: J += (|D| - J) / 16, kept scaled by 16.
    fn update_jitter(&mut self, timestamp: u32) {
        // ---
        if !self.clock.is_synchronized() {
            self.clock.synchronize(timestamp);
        }

        let arrival = self.clock.local_rtp_time() as u32;
        let transit = arrival.wrapping_sub(timestamp) as i32;

        if let Some(previous) = self.transit {
            let d = transit.wrapping_sub(previous).unsigned_abs();
            self.jitter = self
                .jitter
                .wrapping_add(d)
                .wrapping_sub(self.jitter.saturating_add(8) >> 4);
        }
        self.transit = Some(transit);
    }

    /// Returns the head frame once its playout time has come.
    ///
    /// `now_ms` is wall-clock milliseconds on the buffer's clock. Returns
    /// `None` when the buffer is empty or the head is not yet due.
    pub fn read(&mut self, now_ms: u64) -> Option<Frame> {
        // ---
        let head = self.queue.front()?;
        if now_ms < head.arrival_ms + self.config.tolerance_ms as u64 {
            return None;
        }

        let buffered = self.queue.pop_front()?;
        let packet = buffered.packet;

        if let Some(next) = self.queue.front() {
            let delta = next.packet.timestamp.wrapping_sub(packet.timestamp) as u64;
            self.last_duration_ms = delta * 1000 / buffered.format.clock_rate.max(1) as u64;
        }

        self.last_delivered = Some(packet.sequence);

        Some(Frame {
            sequence: packet.sequence,
            timestamp_ms: self.clock.convert_to_absolute_time(packet.timestamp as u64),
            rtp_timestamp: packet.timestamp,
            duration_ms: self.last_duration_ms,
            marker: packet.marker,
            ssrc: packet.ssrc,
            payload: packet.payload,
            format: buffered.format,
        })
    }

    /// Clears queue, counters and the playout pointer.
    pub fn reset(&mut self) {
        // ---
        self.queue.clear();
        self.last_delivered = None;
        self.dropped = 0;
        self.transit = None;
        self.jitter = 0;
        self.last_duration_ms = 0;
        self.late_run = 0;
        self.clock.reset();
    }

    /// Interarrival jitter in timestamp units.
    pub fn estimated_jitter(&self) -> u32 {
        // ---
        self.jitter >> 4
    }

    pub fn dropped(&self) -> u64 {
        // ---
        self.dropped
    }

    pub fn len(&self) -> usize {
        // ---
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.queue.is_empty()
    }

    /// Returns current buffer status for debugging.
    pub fn status(&self) -> JitterBufferStatus {
        // ---
        JitterBufferStatus {
            buffered_packets: self.queue.len(),
            last_delivered: self.last_delivered,
            dropped: self.dropped,
            jitter: self.estimated_jitter(),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn pcmu() -> RtpFormat {
        RtpFormat::new(0, "PCMU", 8000)
    }

    fn make_packet(seq: u16) -> RtpPacket {
        RtpPacket::new(0, seq, seq as u32 * 160, 0x12345678, vec![1, 2, 3])
    }

    fn make_buffer(tolerance_ms: u32) -> (Arc<ManualClock>, JitterBuffer) {
        let wall = Arc::new(ManualClock::new());
        let clock = Arc::new(RtpClock::new(wall.clone()));
        let buffer = JitterBuffer::new(
            JitterBufferConfig {
                tolerance_ms,
                max_packets: 10,
            },
            clock,
        );
        (wall, buffer)
    }

    fn drain(buffer: &mut JitterBuffer, now_ms: u64) -> Vec<u16> {
        std::iter::from_fn(|| buffer.read(now_ms))
            .map(|f| f.sequence)
            .collect()
    }

    #[test]
    fn test_jitter_buffer_in_order() {
        // ---
        let (_, mut buffer) = make_buffer(0);

        for seq in 1..=3 {
            assert_eq!(buffer.write(make_packet(seq), &pcmu()), WriteOutcome::Accepted);
        }

        assert_eq!(drain(&mut buffer, 0), vec![1, 2, 3]);
        assert!(buffer.read(0).is_none());
    }

    #[test]
    fn test_jitter_buffer_reordering() {
        // ---
        let (_, mut buffer) = make_buffer(0);

        buffer.write(make_packet(1), &pcmu());
        buffer.write(make_packet(3), &pcmu());
        buffer.write(make_packet(2), &pcmu()); // Out of sequence

        assert_eq!(drain(&mut buffer, 0), vec![1, 2, 3]);
    }

    #[test]
    fn test_holds_packets_for_tolerance() {
        // ---
        let (wall, mut buffer) = make_buffer(60);

        buffer.write(make_packet(1), &pcmu());
        wall.advance(Duration::from_millis(20));
        buffer.write(make_packet(2), &pcmu());

        assert!(buffer.read(59).is_none());
        assert_eq!(buffer.read(60).map(|f| f.sequence), Some(1));
        assert!(buffer.read(60).is_none());
        assert_eq!(buffer.read(80).map(|f| f.sequence), Some(2));
    }

    #[test]
    fn test_sequence_wraparound() {
        // ---
        let (_, mut buffer) = make_buffer(0);

        for seq in [65534, 65535, 0, 1] {
            buffer.write(make_packet(seq), &pcmu());
        }

        assert_eq!(drain(&mut buffer, 0), vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn test_wraparound_reordered() {
        // ---
        let (_, mut buffer) = make_buffer(0);

        for seq in [0, 65535, 1, 65534] {
            buffer.write(make_packet(seq), &pcmu());
        }

        assert_eq!(drain(&mut buffer, 0), vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn test_late_packet_counted_once() {
        // ---
        let (_, mut buffer) = make_buffer(0);

        buffer.write(make_packet(1), &pcmu());
        buffer.write(make_packet(2), &pcmu());
        assert_eq!(drain(&mut buffer, 0), vec![1, 2]);

        assert_eq!(buffer.write(make_packet(1), &pcmu()), WriteOutcome::Late);
        assert_eq!(buffer.dropped(), 1);
        assert!(buffer.read(0).is_none());
    }

    #[test]
    fn test_outstanding_packet_dropped() {
        // ---
        let (wall, mut buffer) = make_buffer(40);

        buffer.write(make_packet(1), &pcmu());
        buffer.write(make_packet(3), &pcmu());
        buffer.write(make_packet(5), &pcmu());

        wall.advance(Duration::from_millis(50));
        assert_eq!(buffer.read(50).map(|f| f.sequence), Some(1));
        assert_eq!(buffer.read(50).map(|f| f.sequence), Some(3));

        assert_eq!(buffer.write(make_packet(2), &pcmu()), WriteOutcome::Late);
        assert_eq!(buffer.dropped(), 1);
        assert_eq!(buffer.read(50).map(|f| f.sequence), Some(5));
    }

    #[test]
    fn test_duplicate_packets() {
        // ---
        let (_, mut buffer) = make_buffer(0);

        buffer.write(make_packet(1), &pcmu());
        assert_eq!(buffer.write(make_packet(1), &pcmu()), WriteOutcome::Duplicate);

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.dropped(), 0);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        // ---
        let (_, mut buffer) = make_buffer(0);

        for seq in 1..=10 {
            assert_eq!(buffer.write(make_packet(seq), &pcmu()), WriteOutcome::Accepted);
        }
        for seq in 11..=12 {
            assert_eq!(buffer.write(make_packet(seq), &pcmu()), WriteOutcome::Overflow);
        }

        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.write(make_packet(2), &pcmu()), WriteOutcome::Late);
        assert_eq!(buffer.read(0).map(|f| f.sequence), Some(3));
    }

    #[test]
    fn test_restarted_stream_resynchronizes() {
        // ---
        let (_, mut buffer) = make_buffer(0);

        for seq in 20000..20010 {
            buffer.write(make_packet(seq), &pcmu());
            assert_eq!(buffer.read(0).map(|f| f.sequence), Some(seq));
        }

        // Peer restarts far behind the playout pointer
        let mut played = Vec::new();
        for seq in 100..110 {
            let packet = RtpPacket::new(0, seq, seq as u32 * 160, 0x0bad_cafe, vec![1]);
            let outcome = buffer.write(packet, &pcmu());
            if seq < 105 {
                assert_eq!(outcome, WriteOutcome::Late, "seq {seq}");
            } else {
                assert_eq!(outcome, WriteOutcome::Accepted, "seq {seq}");
            }
            played.extend(buffer.read(0).map(|f| f.sequence));
        }

        assert_eq!(played, vec![105, 106, 107, 108, 109]);
        assert_eq!(buffer.dropped(), 5);
    }

    #[test]
    fn test_resync_flushes_queued_packets() {
        // ---
        let (_, mut buffer) = make_buffer(1000);

        buffer.write(make_packet(50), &pcmu());
        assert_eq!(buffer.read(1000).map(|f| f.sequence), Some(50));
        buffer.write(make_packet(60), &pcmu());
        buffer.write(make_packet(61), &pcmu());

        for seq in 1..=5 {
            assert_eq!(buffer.write(make_packet(seq), &pcmu()), WriteOutcome::Late);
        }

        // Five late plus the two stale packets that were waiting
        assert!(buffer.is_empty());
        assert_eq!(buffer.dropped(), 7);
        assert_eq!(buffer.write(make_packet(6), &pcmu()), WriteOutcome::Accepted);
    }

    #[test]
    fn test_isolated_late_packets_keep_position() {
        // ---
        let (_, mut buffer) = make_buffer(0);

        buffer.write(make_packet(10), &pcmu());
        buffer.read(0);
        for round in 0..8u16 {
            assert_eq!(buffer.write(make_packet(9 - round), &pcmu()), WriteOutcome::Late);
            let next = 11 + round;
            assert_eq!(buffer.write(make_packet(next), &pcmu()), WriteOutcome::Accepted);
            assert_eq!(buffer.read(0).map(|f| f.sequence), Some(next));
        }
        assert_eq!(buffer.dropped(), 8);
    }

    #[test]
    fn test_dtmf_leaves_clock_rate_alone() {
        // ---
        let (_, mut buffer) = make_buffer(0);
        let wideband_events = RtpFormat::new(101, "telephone-event", 16000);

        buffer.write(make_packet(1), &pcmu());
        buffer.write(RtpPacket::new(101, 2, 160, 0x12345678, vec![0; 4]), &wideband_events);
        assert_eq!(buffer.clock().clock_rate(), 8000);

        buffer.write(make_packet(3), &pcmu());
        let frame = buffer.read(0).expect("frame due");
        assert_eq!(frame.timestamp_ms, 20);
    }

    #[test]
    fn test_jitter_estimate() {
        // ---
        let (wall, mut buffer) = make_buffer(0);
        let ticks = [0u64, 20, 30, 20, 30];
        let mut estimates = Vec::new();

        for (i, tick) in ticks.iter().enumerate() {
            wall.advance(Duration::from_millis(*tick));
            let packet = RtpPacket::new(0, i as u16, 160 * i as u32, 1, vec![]);
            buffer.write(packet, &pcmu());
            estimates.push(buffer.estimated_jitter());
        }

        assert_eq!(estimates, vec![0, 0, 5, 4, 9]);
    }

    #[test]
    fn test_frame_metadata() {
        // ---
        let (_, mut buffer) = make_buffer(0);

        buffer.write(make_packet(1).with_marker(true), &pcmu());
        buffer.write(make_packet(2), &pcmu());

        let frame = buffer.read(0).expect("frame due");
        assert_eq!(frame.timestamp_ms, 20);
        assert_eq!(frame.duration_ms, 20);
        assert!(frame.marker);
        assert_eq!(frame.format, pcmu());
    }

    #[test]
    fn test_write_mapped_unknown_payload() {
        // ---
        let (_, mut buffer) = make_buffer(0);
        buffer.set_formats([pcmu()].into_iter().collect());

        let pcma = RtpPacket::new(8, 1, 0, 1, vec![]);
        assert_eq!(buffer.write_mapped(pcma), WriteOutcome::UnknownPayload);
        assert_eq!(buffer.write_mapped(make_packet(1)), WriteOutcome::Accepted);
    }

    #[test]
    fn test_reset_clears_state() {
        // ---
        let (_, mut buffer) = make_buffer(0);

        buffer.write(make_packet(5), &pcmu());
        buffer.read(0);
        buffer.write(make_packet(4), &pcmu());
        buffer.write(make_packet(6), &pcmu());
        assert_eq!(buffer.dropped(), 1);

        buffer.reset();
        assert!(buffer.is_empty());
        assert_eq!(buffer.status().last_delivered, None);
        assert_eq!(buffer.dropped(), 0);
        assert_eq!(buffer.write(make_packet(1), &pcmu()), WriteOutcome::Accepted);
    }
}
