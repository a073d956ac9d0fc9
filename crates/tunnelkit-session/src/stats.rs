//! Traffic statistics.
//!
//! Counters are shared between the packet path (increments) and the
//! status path (reads), so they are plain atomics. Timing lives with the
//! session; this module only does the arithmetic.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    /// Bytes received through the tunnel
    pub bytes_in: u64,
    /// Bytes sent through the tunnel
    pub bytes_out: u64,
}

impl TrafficSnapshot {
    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "RX: {:.2}MB, TX: {:.2}MB",
            self.bytes_in as f64 / (1024.0 * 1024.0),
            self.bytes_out as f64 / (1024.0 * 1024.0),
        )
    }
}

/// Byte counters for the active connection.
#[derive(Debug, Default)]
pub struct StatsCounter {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl StatsCounter {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record received bytes.
    pub fn add_in(&self, n: u64) {
        saturating_add(&self.bytes_in, n);
    }

    /// Record sent bytes.
    pub fn add_out(&self, n: u64) {
        saturating_add(&self.bytes_out, n);
    }

    /// Raise the counters to engine-reported totals.
    ///
    /// Engines that keep their own cumulative counters report them here.
    /// Totals lower than what is already recorded are ignored so the
    /// counters never go backwards.
    pub fn observe_totals(&self, bytes_in: u64, bytes_out: u64) {
        self.bytes_in.fetch_max(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_max(bytes_out, Ordering::Relaxed);
    }

    /// Zero both counters.
    pub fn reset(&self) {
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
    }

    /// Bytes received since the last reset.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Bytes sent since the last reset.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Read both counters.
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            bytes_in: self.bytes_in(),
            bytes_out: self.bytes_out(),
        }
    }

    /// Whole seconds elapsed since `connected_at`, or 0 when not connected.
    pub fn elapsed_seconds(connected_at: Option<Instant>) -> u64 {
        connected_at
            .map(|t| Instant::now().saturating_duration_since(t).as_secs())
            .unwrap_or(0)
    }
}

fn saturating_add(counter: &AtomicU64, n: u64) {
    // fetch_update retries on contention, so concurrent adds are never lost
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_add(n))
    });
}
