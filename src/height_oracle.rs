//! The single authoritative reader for chain height / indexed height across
//! the process (spec.md §4.2). Eliminates "phantom numbers" from three
//! independent callers asking three different sources.
//!
//! Grounded on the atomics-behind-a-plain-struct pattern in the teacher's
//! `IndexerMetrics` (`src/metrics.rs`): `AtomicU64` fields read with
//! `Ordering::Relaxed`, published as a snapshot struct on demand.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeightSnapshot {
    pub chain_head: u64,
    pub indexed_head: u64,
    pub sync_lag: u64,
    pub drift_blocks: u64,
    pub is_time_travel: bool,
    pub updated_at: DateTime<Utc>,
}

pub struct HeightOracle {
    chain_head: AtomicU64,
    indexed_head: AtomicU64,
    last_write_millis: AtomicI64,
    drift_tolerance: u64,
    strict_height_check: bool,
}

impl HeightOracle {
    pub fn new(drift_tolerance: u64, strict_height_check: bool) -> Self {
        Self {
            chain_head: AtomicU64::new(0),
            indexed_head: AtomicU64::new(0),
            last_write_millis: AtomicI64::new(Utc::now().timestamp_millis()),
            drift_tolerance,
            strict_height_check,
        }
    }

    fn mark_written(&self) {
        self.last_write_millis.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Called only by the tail-follow routine (WS `newHeads` subscriber).
    pub fn set_chain_head(&self, h: u64) {
        // Chain head only moves forward from this oracle's point of view;
        // a resetting upstream is the Self-Healer's concern, not ours.
        self.chain_head.fetch_max(h, Ordering::Relaxed);
        self.mark_written();
    }

    /// Called only by the Processor after a successful commit.
    pub fn set_indexed_head(&self, h: u64) {
        self.indexed_head.fetch_max(h, Ordering::Relaxed);
        self.mark_written();
        self.check_time_travel();
    }

    pub fn snapshot(&self) -> HeightSnapshot {
        let chain_head = self.chain_head.load(Ordering::Relaxed);
        let indexed_head = self.indexed_head.load(Ordering::Relaxed);
        let sync_lag = chain_head.saturating_sub(indexed_head);
        let drift_blocks = indexed_head.saturating_sub(chain_head);
        let millis = self.last_write_millis.load(Ordering::Relaxed);
        let updated_at = Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now);
        HeightSnapshot {
            chain_head,
            indexed_head,
            sync_lag,
            drift_blocks,
            is_time_travel: drift_blocks > self.drift_tolerance,
            updated_at,
        }
    }

    fn check_time_travel(&self) {
        if !self.strict_height_check {
            return;
        }
        let snap = self.snapshot();
        if snap.is_time_travel {
            error!(
                chain_head = snap.chain_head,
                indexed_head = snap.indexed_head,
                drift_blocks = snap.drift_blocks,
                "time travel detected: indexed head ahead of chain head beyond tolerance"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_lag_is_zero_when_caught_up() {
        let oracle = HeightOracle::new(5, false);
        oracle.set_chain_head(100);
        oracle.set_indexed_head(100);
        let s = oracle.snapshot();
        assert_eq!(s.sync_lag, 0);
        assert_eq!(s.drift_blocks, 0);
        assert!(!s.is_time_travel);
    }

    #[test]
    fn drift_beyond_tolerance_flags_time_travel() {
        let oracle = HeightOracle::new(5, false);
        oracle.set_chain_head(100);
        oracle.set_indexed_head(110);
        let s = oracle.snapshot();
        assert_eq!(s.drift_blocks, 10);
        assert!(s.is_time_travel);
    }

    #[test]
    fn drift_within_tolerance_is_not_time_travel() {
        let oracle = HeightOracle::new(5, false);
        oracle.set_chain_head(100);
        oracle.set_indexed_head(103);
        assert!(!oracle.snapshot().is_time_travel);
    }

    #[test]
    fn chain_head_never_moves_backward() {
        let oracle = HeightOracle::new(5, false);
        oracle.set_chain_head(100);
        oracle.set_chain_head(90);
        assert_eq!(oracle.snapshot().chain_head, 100);
    }

    #[test]
    fn updated_at_reflects_the_last_write_not_the_read_time() {
        let oracle = HeightOracle::new(5, false);
        let before = oracle.snapshot().updated_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        oracle.set_chain_head(50);
        let after = oracle.snapshot().updated_at;
        assert!(after >= before);
    }
}
