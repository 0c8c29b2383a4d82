// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared by every stage of the pipeline.
///
/// The drop counter itself lives on the queue, which is the only place that
/// drops; [`PipelineStats::snapshot`] takes it as an argument so the snapshot
/// shows every counter side by side.
#[derive(Debug, Default)]
pub struct PipelineStats {
    accepted: AtomicU64,
    malformed: AtomicU64,
    exported: AtomicU64,
    failed_exports: AtomicU64,
    retries: AtomicU64,
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Records accepted into the queue.
    pub accepted: u64,
    /// Records dropped by the queue (overflow, closed queue, shutdown discard).
    pub dropped: u64,
    /// Raw events rejected by the source adapter.
    pub malformed: u64,
    /// Spans the sink accepted.
    pub exported: u64,
    /// Records discarded after exhausting their submission attempts.
    pub failed_exports: u64,
    /// Extra submission attempts made after a failure.
    pub retries: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exported(&self) {
        self.exported.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_export(&self) {
        self.failed_exports.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn exported(&self) -> u64 {
        self.exported.load(Ordering::Relaxed)
    }

    pub fn failed_exports(&self) -> u64 {
        self.failed_exports.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, dropped: u64) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped,
            malformed: self.malformed.load(Ordering::Relaxed),
            exported: self.exported.load(Ordering::Relaxed),
            failed_exports: self.failed_exports.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "accepted={} dropped={} malformed={} exported={} failed_exports={} retries={}",
            self.accepted,
            self.dropped,
            self.malformed,
            self.exported,
            self.failed_exports,
            self.retries
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = PipelineStats::new();
        stats.record_accepted();
        stats.record_accepted();
        stats.record_exported();
        stats.record_failed_export();
        stats.record_retry();
        stats.record_retry();
        stats.record_malformed();

        let snapshot = stats.snapshot(3);
        assert_eq!(
            snapshot,
            StatsSnapshot {
                accepted: 2,
                dropped: 3,
                malformed: 1,
                exported: 1,
                failed_exports: 1,
                retries: 2,
            }
        );
        assert_eq!(
            snapshot.to_string(),
            "accepted=2 dropped=3 malformed=1 exported=1 failed_exports=1 retries=2"
        );
    }
}
