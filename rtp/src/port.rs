//! RTP port allocation.

use std::sync::atomic::{AtomicU32, Ordering};

/// Default first RTP port.
pub const DEFAULT_LOW_PORT: u16 = 61000;

/// Default last RTP port.
pub const DEFAULT_HIGH_PORT: u16 = 62000;

/// Hands out even RTP ports from a range, round-robin.
///
/// RTCP goes on the odd port above when rtcp-mux is off, so only even ports
/// are allocated. Ports are not tracked as in use: a bind failure on one
/// port is handled by the caller asking for the next.
#[derive(Debug)]
pub struct PortManager {
    // ---
    low: u16,
    slots: u32,
    cursor: AtomicU32,
}

impl PortManager {
    // ---
    /// Creates a manager for `low..=high`; `low` is rounded up to even.
    pub fn new(low: u16, high: u16) -> Self {
        // ---
        let low = low.saturating_add(low % 2);
        let high = high.max(low);
        Self {
            low,
            slots: (high - low) as u32 / 2 + 1,
            cursor: AtomicU32::new(0),
        }
    }

    pub fn low(&self) -> u16 {
        // ---
        self.low
    }

    pub fn high(&self) -> u16 {
        // ---
        self.low + ((self.slots - 1) * 2) as u16
    }

    /// Next even port in the range, wrapping back to the start.
    pub fn next(&self) -> u16 {
        // ---
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % self.slots;
        self.low + (slot * 2) as u16
    }

    /// The port the next call to [`PortManager::next`] would return.
    pub fn peek(&self) -> u16 {
        // ---
        let slot = self.cursor.load(Ordering::Relaxed) % self.slots;
        self.low + (slot * 2) as u16
    }
}

impl Default for PortManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOW_PORT, DEFAULT_HIGH_PORT)
    }
}
