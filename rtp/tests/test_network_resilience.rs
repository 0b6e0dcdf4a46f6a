//! Integration tests for network resilience.
//!
//! Drives the jitter buffer and receive statistics with simulated network
//! conditions: packet loss, jitter, and reordering. Time comes from a manual
//! clock stepped in 5ms increments.


use mgw_rtp::{
    Frame, JitterBuffer, JitterBufferConfig, ManualClock, RtpClock, RtpFormat, RtpPacket,
    RtpStatistics, WallClock, WriteOutcome,
};
use network_simulator::{NetworkSimulator, NetworkSimulatorConfig};
use std::sync::Arc;
use std::time::Duration;

const FRAME_MS: u64 = 20;
const STEP_MS: u64 = 5;

fn pcmu() -> RtpFormat {
    RtpFormat::new(0, "PCMU", 8000)
}

fn make_packets(first_seq: u16, count: usize) -> Vec<RtpPacket> {
    // ---
    (0..count)
        .map(|i| {
            let seq = first_seq.wrapping_add(i as u16);
            RtpPacket::new(0, seq, (i as u32) * 160, 0x12345678, vec![0xD5; 160])
        })
        .collect()
}

fn buffer_with(tolerance_ms: u32, max_packets: usize) -> (Arc<ManualClock>, JitterBuffer) {
    // ---
    let wall = Arc::new(ManualClock::new());
    let clock = Arc::new(RtpClock::new(wall.clone()));
    let buffer = JitterBuffer::new(
        JitterBufferConfig {
            tolerance_ms,
            max_packets,
        },
        clock,
    );
    (wall, buffer)
}

/// Sends one packet every 20ms through the simulator into the buffer and
/// reads the buffer on every step until everything has drained.
fn run_pipeline(
    sim: &mut NetworkSimulator,
    wall: &ManualClock,
    buffer: &mut JitterBuffer,
    packets: Vec<RtpPacket>,
) -> Vec<Frame> {
    // ---
    let format = pcmu();
    let total = packets.len();
    let mut pending = packets.into_iter();
    let mut sent = 0usize;
    let mut frames = Vec::new();

    for _ in 0..100_000 {
        let now = wall.now_millis();

        if sent < total && now % FRAME_MS == 0 {
            if let Some(packet) = pending.next() {
                sim.send(packet, now);
                sent += 1;
            }
        }

        while let Some(packet) = sim.receive(now) {
            buffer.write(packet, &format);
        }

        while let Some(frame) = buffer.read(now) {
            frames.push(frame);
        }

        if sent == total && sim.in_flight() == 0 && buffer.is_empty() {
            break;
        }
        wall.advance(Duration::from_millis(STEP_MS));
    }

    frames
}

fn assert_strictly_increasing(frames: &[Frame]) {
    // ---
    for pair in frames.windows(2) {
        let delta = pair[1].sequence.wrapping_sub(pair[0].sequence) as i16;
        assert!(
            delta > 0,
            "out of order playout: {} then {}",
            pair[0].sequence,
            pair[1].sequence
        );
    }
}

/// Tests that jitter and reordering inside the tolerance never cost a packet.
#[test]
fn test_reordering_within_tolerance() {
    // ---
    let mut sim = NetworkSimulator::new(NetworkSimulatorConfig {
        loss_rate: 0.05,
        jitter_ms: 10,
        reorder_rate: 0.2,
        reorder_hold_ms: 30,
        seed: 42,
    });
    let (wall, mut buffer) = buffer_with(80, 50);

    let frames = run_pipeline(&mut sim, &wall, &mut buffer, make_packets(0, 100));
    let stats = sim.stats();

    assert_strictly_increasing(&frames);
    assert_eq!(buffer.dropped(), 0);
    assert_eq!(frames.len() as u64, stats.packets_sent - stats.packets_lost);

    println!(
        "✓ {} frames played in order ({} lost, {} reordered on the wire)",
        frames.len(),
        stats.packets_lost,
        stats.packets_reordered
    );
}

/// Tests that packets held back past their successor's playout are counted.
#[test]
fn test_late_packets_are_counted() {
    // ---
    let mut sim = NetworkSimulator::new(NetworkSimulatorConfig {
        loss_rate: 0.1,
        jitter_ms: 0,
        reorder_rate: 0.3,
        reorder_hold_ms: 50,
        seed: 7,
    });
    let (wall, mut buffer) = buffer_with(0, 50);

    let frames = run_pipeline(&mut sim, &wall, &mut buffer, make_packets(1000, 100));
    let stats = sim.stats();

    assert_strictly_increasing(&frames);
    assert!(buffer.dropped() > 0, "expected late packets to be dropped");
    assert_eq!(
        frames.len() as u64 + buffer.dropped(),
        stats.packets_sent - stats.packets_lost,
        "every surviving packet is either played or counted as dropped"
    );

    println!(
        "✓ {} played, {} dropped late, {} lost",
        frames.len(),
        buffer.dropped(),
        stats.packets_lost
    );
}

/// Tests playout across the 16-bit sequence wrap with jitter on the wire.
#[test]
fn test_sequence_wraparound_under_jitter() {
    // ---
    let mut sim = NetworkSimulator::new(NetworkSimulatorConfig {
        jitter_ms: 15,
        seed: 3,
        ..Default::default()
    });
    let (wall, mut buffer) = buffer_with(60, 50);

    let frames = run_pipeline(&mut sim, &wall, &mut buffer, make_packets(65500, 80));

    assert_eq!(frames.len(), 80);
    assert_strictly_increasing(&frames);
    assert_eq!(frames.first().map(|f| f.sequence), Some(65500));
    assert_eq!(frames.last().map(|f| f.sequence), Some(43));

    println!("✓ Sequence wraparound played in order");
}

/// Tests that a small buffer under reordering overflows instead of growing.
#[test]
fn test_overflow_bounds_occupancy() {
    // ---
    let mut sim = NetworkSimulator::new(NetworkSimulatorConfig {
        jitter_ms: 5,
        reorder_rate: 0.2,
        reorder_hold_ms: 40,
        seed: 11,
        ..Default::default()
    });
    let (wall, mut buffer) = buffer_with(200, 4);
    let format = pcmu();

    for packet in make_packets(0, 60) {
        let now = wall.now_millis();
        sim.send(packet, now);
        while let Some(p) = sim.receive(now) {
            buffer.write(p, &format);
            assert!(buffer.len() <= 4);
        }
        wall.advance(Duration::from_millis(FRAME_MS));
    }

    assert!(buffer.dropped() > 0);
    println!("✓ Overflow dropped {} packets", buffer.dropped());
}

/// Tests that a sender restarting behind the playout pointer recovers.
#[test]
fn test_restarted_sender_recovers() {
    // ---
    let mut sim = NetworkSimulator::new(NetworkSimulatorConfig {
        jitter_ms: 5,
        seed: 21,
        ..Default::default()
    });
    let (wall, mut buffer) = buffer_with(60, 20);

    let before = run_pipeline(&mut sim, &wall, &mut buffer, make_packets(30000, 40));
    assert_eq!(before.len(), 40);
    assert_eq!(buffer.dropped(), 0);

    // Half a buffer's worth of late packets, then playout starts over
    let after = run_pipeline(&mut sim, &wall, &mut buffer, make_packets(500, 60));

    assert_eq!(buffer.dropped(), 10);
    assert_eq!(after.len(), 50);
    assert_strictly_increasing(&after);
    assert_eq!(after.first().map(|f| f.sequence), Some(510));
    assert_eq!(after.last().map(|f| f.sequence), Some(559));

    println!("✓ Restarted sender played after {} late packets", buffer.dropped());
}

/// Tests receive statistics against the simulator's ground truth.
#[test]
fn test_loss_statistics_match_simulator() {
    // ---
    let mut sim = NetworkSimulator::new(NetworkSimulatorConfig {
        loss_rate: 0.1,
        seed: 99,
        ..Default::default()
    });
    let mut stats = RtpStatistics::new(Duration::from_secs(3600));
    let packets = make_packets(0, 202);
    let last = packets.len() - 1;

    // First and last packets bypass the simulator so every gap is bounded.
    for (i, packet) in packets.into_iter().enumerate() {
        if i == 0 || i == last {
            stats.record_received(packet.sequence, packet.payload.len());
            continue;
        }
        sim.send(packet, 0);
        while let Some(p) = sim.receive(0) {
            stats.record_received(p.sequence, p.payload.len());
        }
    }

    let lost = sim.stats().packets_lost;
    assert_eq!(stats.packets_lost, lost);
    assert_eq!(stats.packets_received, 202 - lost);
    assert!(stats.loss_percentage() > 0.0);

    println!("✓ Loss accounting: {:.1}%", stats.loss_percentage());
}

/// Tests the interarrival jitter estimate for a single delay step.
#[test]
fn test_jitter_single_delay_step() {
    // ---
    let (wall, mut buffer) = buffer_with(0, 100);
    let format = pcmu();

    // Steady 20ms spacing, then every packet from the 10th on is 10ms later.
    for (i, packet) in make_packets(0, 10).into_iter().enumerate() {
        assert_eq!(buffer.write(packet, &format), WriteOutcome::Accepted);
        assert_eq!(buffer.estimated_jitter(), 0, "packet {i}");
        wall.advance(Duration::from_millis(FRAME_MS));
    }

    wall.advance(Duration::from_millis(10));
    let step = RtpPacket::new(0, 10, 10 * 160, 0x12345678, vec![0xD5; 160]);
    buffer.write(step, &format);

    // D = 80 units at 8kHz
    assert_eq!(buffer.estimated_jitter(), 80 / 16);
    println!("✓ Single delay step estimate: {}", buffer.estimated_jitter());
}

/// Tests that an alternating delay converges to the step size.
#[test]
fn test_jitter_alternating_delay_converges() {
    // ---
    let (wall, mut buffer) = buffer_with(0, 1000);
    let format = pcmu();

    // Arrivals at 0, 40, 40, 80, 80, ...: transit alternates by 160 units.
    let mut arrival_ms = 0u64;
    for (i, packet) in make_packets(0, 300).into_iter().enumerate() {
        let target = (i as u64) * FRAME_MS + (i as u64 % 2) * FRAME_MS;
        if target > arrival_ms {
            wall.advance(Duration::from_millis(target - arrival_ms));
            arrival_ms = target;
        }
        buffer.write(packet, &format);
        while buffer.read(wall.now_millis()).is_some() {}
    }

    let estimate = buffer.estimated_jitter();
    assert!(
        (155..=160).contains(&estimate),
        "estimate {estimate} should approach 160"
    );
    println!("✓ Alternating delay estimate: {}", estimate);
}
