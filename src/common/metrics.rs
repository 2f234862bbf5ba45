//! Counters for the unpacking pipeline
//!
//! # Design Principles (KISS)
//! - Lock-free atomic counters on the hot path
//! - Simple snapshot mechanism for reporting
//! - Relaxed ordering; totals are eventually consistent

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Block and hit counters shared by the pipeline stages
#[derive(Debug, Default)]
pub struct AtomicCounters {
    /// Blocks read from the source
    pub blocks_received: AtomicU64,
    /// Blocks unpacked successfully
    pub blocks_processed: AtomicU64,
    /// Blocks set aside because they failed validation or unpacking
    pub blocks_quarantined: AtomicU64,
    /// Sequence problems (event gaps, run changes, counter jumps)
    pub sequence_issues: AtomicU64,
    /// Raw hits decoded
    pub raw_hits: AtomicU64,
    /// Calibrated digits produced
    pub digits: AtomicU64,
    /// Non-fatal unpack problems
    pub unpack_issues: AtomicU64,
    /// Bytes read
    pub bytes: AtomicU64,
}

impl AtomicCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_received(&self, nbytes: u64) {
        self.blocks_received.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(nbytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_processed(&self) {
        self.blocks_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_quarantined(&self) {
        self.blocks_quarantined.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_sequence_issues(&self, n: u64) {
        self.sequence_issues.fetch_add(n, Ordering::Relaxed);
    }

    /// Record the output of one unpacked block
    #[inline]
    pub fn add_event(&self, raw_hits: u64, digits: u64, issues: u64) {
        self.raw_hits.fetch_add(raw_hits, Ordering::Relaxed);
        self.digits.fetch_add(digits, Ordering::Relaxed);
        self.unpack_issues.fetch_add(issues, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            blocks_received: self.blocks_received.load(Ordering::Relaxed),
            blocks_processed: self.blocks_processed.load(Ordering::Relaxed),
            blocks_quarantined: self.blocks_quarantined.load(Ordering::Relaxed),
            sequence_issues: self.sequence_issues.load(Ordering::Relaxed),
            raw_hits: self.raw_hits.load(Ordering::Relaxed),
            digits: self.digits.load(Ordering::Relaxed),
            unpack_issues: self.unpack_issues.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.blocks_received,
            &self.blocks_processed,
            &self.blocks_quarantined,
            &self.sequence_issues,
            &self.raw_hits,
            &self.digits,
            &self.unpack_issues,
            &self.bytes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Counter values at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub blocks_received: u64,
    pub blocks_processed: u64,
    pub blocks_quarantined: u64,
    pub sequence_issues: u64,
    pub raw_hits: u64,
    pub digits: u64,
    pub unpack_issues: u64,
    pub bytes: u64,
}

impl CounterSnapshot {
    /// Rates between two snapshots given elapsed seconds
    pub fn rate_from(&self, prev: &CounterSnapshot, elapsed_secs: f64) -> RateSnapshot {
        if elapsed_secs <= 0.0 {
            return RateSnapshot::default();
        }
        let per_sec = |now: u64, before: u64| now.saturating_sub(before) as f64 / elapsed_secs;
        RateSnapshot {
            blocks_rate: per_sec(self.blocks_processed, prev.blocks_processed),
            hits_rate: per_sec(self.raw_hits, prev.raw_hits),
            bytes_rate: per_sec(self.bytes, prev.bytes),
        }
    }
}

/// Rates from counter snapshots
#[derive(Debug, Clone, Copy, Default)]
pub struct RateSnapshot {
    /// Blocks processed per second
    pub blocks_rate: f64,
    /// Raw hits per second
    pub hits_rate: f64,
    /// Bytes per second
    pub bytes_rate: f64,
}

impl RateSnapshot {
    /// Bytes rate as human-readable string (KB/s, MB/s, etc.)
    pub fn format_bytes_rate(&self) -> String {
        if self.bytes_rate >= 1_000_000_000.0 {
            format!("{:.2} GB/s", self.bytes_rate / 1_000_000_000.0)
        } else if self.bytes_rate >= 1_000_000.0 {
            format!("{:.2} MB/s", self.bytes_rate / 1_000_000.0)
        } else if self.bytes_rate >= 1_000.0 {
            format!("{:.2} KB/s", self.bytes_rate / 1_000.0)
        } else {
            format!("{:.0} B/s", self.bytes_rate)
        }
    }

    /// Block rate as human-readable string (K/s, M/s, etc.)
    pub fn format_blocks_rate(&self) -> String {
        if self.blocks_rate >= 1_000_000.0 {
            format!("{:.2} M/s", self.blocks_rate / 1_000_000.0)
        } else if self.blocks_rate >= 1_000.0 {
            format!("{:.2} K/s", self.blocks_rate / 1_000.0)
        } else {
            format!("{:.0} /s", self.blocks_rate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let counters = AtomicCounters::new();
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }

    #[test]
    fn test_block_counters() {
        let counters = AtomicCounters::new();
        counters.inc_received(120);
        counters.inc_received(80);
        counters.inc_processed();
        counters.inc_quarantined();
        counters.add_sequence_issues(2);
        counters.add_event(10, 9, 1);

        let snap = counters.snapshot();
        assert_eq!(snap.blocks_received, 2);
        assert_eq!(snap.bytes, 200);
        assert_eq!(snap.blocks_processed, 1);
        assert_eq!(snap.blocks_quarantined, 1);
        assert_eq!(snap.sequence_issues, 2);
        assert_eq!(snap.raw_hits, 10);
        assert_eq!(snap.digits, 9);
        assert_eq!(snap.unpack_issues, 1);
    }

    #[test]
    fn test_reset() {
        let counters = AtomicCounters::new();
        counters.inc_received(100);
        counters.add_event(5, 5, 0);
        counters.reset();
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }

    #[test]
    fn test_rate_calculation() {
        let prev = CounterSnapshot {
            blocks_processed: 100,
            raw_hits: 1000,
            bytes: 10_000,
            ..Default::default()
        };
        let current = CounterSnapshot {
            blocks_processed: 300,
            raw_hits: 3000,
            bytes: 30_000,
            ..Default::default()
        };

        // 2 second interval
        let rate = current.rate_from(&prev, 2.0);
        assert_eq!(rate.blocks_rate, 100.0);
        assert_eq!(rate.hits_rate, 1000.0);
        assert_eq!(rate.bytes_rate, 10_000.0);
    }

    #[test]
    fn test_rate_zero_elapsed() {
        let current = CounterSnapshot {
            blocks_processed: 100,
            ..Default::default()
        };
        let rate = current.rate_from(&CounterSnapshot::default(), 0.0);
        assert_eq!(rate.blocks_rate, 0.0);
    }

    #[test]
    fn test_format_rates() {
        let rate = RateSnapshot {
            bytes_rate: 1_500_000.0,
            blocks_rate: 1500.0,
            ..Default::default()
        };
        assert_eq!(rate.format_bytes_rate(), "1.50 MB/s");
        assert_eq!(rate.format_blocks_rate(), "1.50 K/s");

        let rate = RateSnapshot {
            bytes_rate: 500.0,
            blocks_rate: 20.0,
            ..Default::default()
        };
        assert_eq!(rate.format_bytes_rate(), "500 B/s");
        assert_eq!(rate.format_blocks_rate(), "20 /s");
    }
}
