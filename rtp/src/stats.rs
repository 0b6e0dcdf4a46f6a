//! Per-session RTP statistics.
//!
//! Tracks both directions of a media session: packets and bytes sent and
//! received, loss inferred from sequence gaps, reordering and late arrivals.
//! Counters are logged periodically and mirrored into Prometheus when a
//! `MetricsContext` is attached.

use mgw_common::MetricsContext;
use std::time::{Duration, Instant};
use tracing::info;

/// Network and reception statistics for one media session.
#[derive(Clone)]
pub struct RtpStatistics {
    // ---
    /// Total packets received successfully
    pub packets_received: u64,

    /// Total payload bytes received
    pub bytes_received: u64,

    /// Total packets sent
    pub packets_sent: u64,

    /// Total payload bytes sent
    pub bytes_sent: u64,

    /// Total packets lost (detected via sequence gaps)
    pub packets_lost: u64,

    /// Total packets that arrived out of order
    pub packets_reordered: u64,

    /// Total packets that arrived too late (after playout deadline)
    pub packets_late: u64,

    /// Packets the jitter buffer threw away to make room or to resynchronize
    pub packets_discarded: u64,

    /// Highest sequence number seen
    last_sequence: Option<u16>,

    /// Start time for rate calculations
    start_time: Instant,

    /// Last time stats were logged
    last_log_time: Instant,

    /// Interval between periodic logs
    log_interval: Duration,

    metrics: Option<MetricsContext>,
}

impl std::fmt::Debug for RtpStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpStatistics")
            .field("packets_received", &self.packets_received)
            .field("packets_sent", &self.packets_sent)
            .field("packets_lost", &self.packets_lost)
            .field("packets_reordered", &self.packets_reordered)
            .field("packets_late", &self.packets_late)
            .field("packets_discarded", &self.packets_discarded)
            .finish()
    }
}

impl RtpStatistics {
    // ---
    /// Creates a new stats tracker.
    ///
    /// # Arguments
    ///
    /// * `log_interval` - How often to automatically log stats
    pub fn new(log_interval: Duration) -> Self {
        // ---
        let now = Instant::now();
        Self {
            packets_received: 0,
            bytes_received: 0,
            packets_sent: 0,
            bytes_sent: 0,
            packets_lost: 0,
            packets_reordered: 0,
            packets_late: 0,
            packets_discarded: 0,
            last_sequence: None,
            start_time: now,
            last_log_time: now,
            log_interval,
            metrics: None,
        }
    }

    /// Mirrors every counter update into `metrics`.
    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        // ---
        self.metrics = Some(metrics);
        self
    }

    /// Records a received packet.
    ///
    /// A sequence number behind the highest seen counts as reordered; a jump
    /// ahead counts the skipped numbers as lost. A reordered packet that
    /// fills a gap removes one from the loss count.
    ///
    /// # Arguments
    ///
    /// * `sequence` - Sequence number of received packet
    /// * `payload_len` - Payload size in bytes
    pub fn record_received(&mut self, sequence: u16, payload_len: usize) {
        // ---
        self.packets_received += 1;
        self.bytes_received += payload_len as u64;

        if let Some(metrics) = &self.metrics {
            metrics.rtp_packets_received_total.inc();
            metrics.rtp_bytes_received_total.inc_by(payload_len as u64);
        }

        match self.last_sequence {
            None => self.last_sequence = Some(sequence),
            Some(last) => {
                let delta = sequence.wrapping_sub(last) as i16;
                if delta > 0 {
                    // Gap detected - skipped numbers are lost until they show up
                    self.packets_lost += (delta - 1) as u64;
                    self.last_sequence = Some(sequence);
                } else if delta < 0 {
                    self.packets_reordered += 1;
                    self.packets_lost = self.packets_lost.saturating_sub(1);
                }
            }
        }

        // Periodic logging
        self.maybe_log();
    }

    /// Records a packet handed to the transport.
    pub fn record_sent(&mut self, payload_len: usize) {
        // ---
        self.packets_sent += 1;
        self.bytes_sent += payload_len as u64;

        if let Some(metrics) = &self.metrics {
            metrics.rtp_packets_sent_total.inc();
            metrics.rtp_bytes_sent_total.inc_by(payload_len as u64);
        }
    }

    /// Records a packet that arrived too late to be played.
    pub fn record_late_packet(&mut self) {
        // ---
        self.packets_late += 1;

        if let Some(metrics) = &self.metrics {
            metrics.jitter_buffer_dropped_total.inc();
        }
    }

    /// Records packets dropped from the jitter buffer queue.
    pub fn record_discarded(&mut self, count: u64) {
        // ---
        self.packets_discarded += count;

        if let Some(metrics) = &self.metrics {
            metrics.jitter_buffer_dropped_total.inc_by(count);
        }
    }

    /// Calculates current packet loss percentage.
    pub fn loss_percentage(&self) -> f64 {
        // ---
        let total = self.packets_received + self.packets_lost;
        if total == 0 {
            0.0
        } else {
            (self.packets_lost as f64 / total as f64) * 100.0
        }
    }

    /// Calculates reorder percentage.
    pub fn reorder_percentage(&self) -> f64 {
        // ---
        if self.packets_received == 0 {
            0.0
        } else {
            (self.packets_reordered as f64 / self.packets_received as f64) * 100.0
        }
    }

    /// Calculates packets per second reception rate.
    pub fn packets_per_second(&self) -> f64 {
        // ---
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.packets_received as f64 / elapsed
        }
    }

    /// Returns runtime duration.
    pub fn runtime(&self) -> Duration {
        // ---
        self.start_time.elapsed()
    }

    /// Clears all counters; the metrics handle stays attached.
    pub fn reset(&mut self) {
        // ---
        let metrics = self.metrics.take();
        *self = Self::new(self.log_interval);
        self.metrics = metrics;
    }

    /// Logs statistics if interval has elapsed.
    fn maybe_log(&mut self) {
        // ---
        if self.last_log_time.elapsed() >= self.log_interval {
            self.log();
            self.last_log_time = Instant::now();
        }
    }

    /// Force log current statistics.
    pub fn log(&self) {
        // ---
        info!(
            "RTP Stats: rx {} pkts ({:.2} pkt/s), tx {} pkts, {:.2}% loss, {:.2}% reordered, {} late, {} discarded",
            self.packets_received,
            self.packets_per_second(),
            self.packets_sent,
            self.loss_percentage(),
            self.reorder_percentage(),
            self.packets_late,
            self.packets_discarded
        );
    }
}

impl Default for RtpStatistics {
    fn default() -> Self {
        // ---
        Self::new(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_stats_no_loss() {
        // ---
        let mut stats = RtpStatistics::default();

        for seq in 0..3 {
            stats.record_received(seq, 160);
        }

        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.bytes_received, 480);
        assert_eq!(stats.packets_lost, 0);
        assert_eq!(stats.loss_percentage(), 0.0);
    }

    #[test]
    fn test_stats_with_loss() {
        // ---
        let mut stats = RtpStatistics::default();

        stats.record_received(0, 0);
        stats.record_received(1, 0);
        stats.record_received(5, 0); // Gap: lost 2, 3, 4

        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_lost, 3);
        assert_eq!(stats.loss_percentage(), 50.0); // 3 lost out of 6 total
    }

    #[test]
    fn test_reordered_packet_fills_gap() {
        // ---
        let mut stats = RtpStatistics::default();

        stats.record_received(0, 0);
        stats.record_received(2, 0);
        stats.record_received(1, 0); // Out of order

        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_reordered, 1);
        assert_eq!(stats.packets_lost, 0);

        // Use approximate equality for floating point
        let expected = 100.0 / 3.0;
        let actual = stats.reorder_percentage();
        assert!(
            (actual - expected).abs() < 0.001,
            "Expected ~{}, got {}",
            expected,
            actual
        );
    }

    #[test]
    fn test_sequence_wraparound() {
        // ---
        let mut stats = RtpStatistics::default();

        stats.record_received(65534, 0);
        stats.record_received(65535, 0);
        stats.record_received(0, 0); // Wraparound

        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_lost, 0);
    }

    #[test]
    fn test_sent_and_late() {
        // ---
        let mut stats = RtpStatistics::default();

        stats.record_sent(160);
        stats.record_sent(160);
        stats.record_late_packet();

        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.bytes_sent, 320);
        assert_eq!(stats.packets_late, 1);

        stats.reset();
        assert_eq!(stats.packets_sent, 0);
    }

    #[test]
    fn test_mirrors_into_metrics() {
        // ---
        let metrics = MetricsContext::new("stats-test").expect("metrics init");
        let mut stats = RtpStatistics::default().with_metrics(metrics.clone());

        stats.record_received(1, 100);
        stats.record_sent(40);
        stats.record_late_packet();
        stats.record_discarded(3);

        assert_eq!(metrics.rtp_packets_received_total.get(), 1);
        assert_eq!(metrics.rtp_bytes_received_total.get(), 100);
        assert_eq!(metrics.rtp_bytes_sent_total.get(), 40);
        assert_eq!(metrics.jitter_buffer_dropped_total.get(), 4);
        assert_eq!(stats.packets_late, 1);
        assert_eq!(stats.packets_discarded, 3);
    }
}
