//! Wall clocks and the RTP media clock.
//!
//! The RTP clock turns wall-clock milliseconds into timestamp units at the
//! current sampling rate. All arithmetic is integral.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default sampling rate for narrowband audio.
pub const DEFAULT_CLOCK_RATE: u32 = 8000;

/// Source of monotonic wall-clock time.
pub trait WallClock: Send + Sync + fmt::Debug {
    /// Nanoseconds since an arbitrary, fixed origin.
    fn now_nanos(&self) -> u64;

    fn now_millis(&self) -> u64 {
        self.now_nanos() / 1_000_000
    }
}

/// Wall clock backed by `Instant`.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WallClock for SystemClock {
    fn now_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Wall clock that only moves when told to. Used to drive timing
/// deterministically in tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    // ---
    pub fn new() -> Self {
        // ---
        Self::default()
    }

    /// Advances the clock by `nanos` nanoseconds.
    pub fn tick(&self, nanos: u64) {
        // ---
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        // ---
        self.tick(by.as_nanos() as u64);
    }
}

impl WallClock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

/// Maps wall-clock time onto RTP timestamp units.
///
/// `synchronize` anchors the clock to a remote timestamp so that
/// [`RtpClock::local_rtp_time`] reads in the remote stream's numbering space.
/// The clock is shared between the receive and transmit sides of one
/// session, so its state lives in atomics.
#[derive(Debug)]
pub struct RtpClock {
    // ---
    wall: Arc<dyn WallClock>,
    clock_rate: AtomicU32,
    drift: AtomicI64,
    synchronized: AtomicBool,
}

impl RtpClock {
    // ---
    pub fn new(wall: Arc<dyn WallClock>) -> Self {
        // ---
        Self::with_rate(wall, DEFAULT_CLOCK_RATE)
    }

    pub fn with_rate(wall: Arc<dyn WallClock>, clock_rate: u32) -> Self {
        // ---
        Self {
            wall,
            clock_rate: AtomicU32::new(clock_rate.max(1)),
            drift: AtomicI64::new(0),
            synchronized: AtomicBool::new(false),
        }
    }

    pub fn wall_clock(&self) -> &Arc<dyn WallClock> {
        // ---
        &self.wall
    }

    /// Current wall-clock time in milliseconds.
    pub fn wall_millis(&self) -> u64 {
        // ---
        self.wall.now_millis()
    }

    pub fn clock_rate(&self) -> u32 {
        // ---
        self.clock_rate.load(Ordering::Relaxed)
    }

    /// Changes the sampling rate. Zero is ignored.
    pub fn set_clock_rate(&self, clock_rate: u32) {
        // ---
        if clock_rate > 0 {
            self.clock_rate.store(clock_rate, Ordering::Relaxed);
        }
    }

    fn unsynchronized_rtp_time(&self) -> i64 {
        // ---
        self.convert_to_rtp_time(self.wall.now_millis()) as i64
    }

    /// Current time in RTP units, in the synchronized numbering space.
    pub fn local_rtp_time(&self) -> i64 {
        // ---
        self.unsynchronized_rtp_time() + self.drift.load(Ordering::Relaxed)
    }

    /// Anchors the clock so that "now" reads as `remote_timestamp`.
    pub fn synchronize(&self, remote_timestamp: u32) {
        // ---
        let drift = remote_timestamp as i64 - self.unsynchronized_rtp_time();
        self.drift.store(drift, Ordering::Relaxed);
        self.synchronized.store(true, Ordering::Relaxed);
    }

    pub fn is_synchronized(&self) -> bool {
        // ---
        self.synchronized.load(Ordering::Relaxed)
    }

    /// RTP units to milliseconds at the current rate.
    pub fn convert_to_absolute_time(&self, timestamp: u64) -> u64 {
        // ---
        timestamp * 1000 / self.clock_rate() as u64
    }

    /// Milliseconds to RTP units at the current rate.
    pub fn convert_to_rtp_time(&self, millis: u64) -> u64 {
        // ---
        millis * self.clock_rate() as u64 / 1000
    }

    /// Drops the synchronization anchor.
    pub fn reset(&self) {
        // ---
        self.drift.store(0, Ordering::Relaxed);
        self.synchronized.store(false, Ordering::Relaxed);
    }
}
