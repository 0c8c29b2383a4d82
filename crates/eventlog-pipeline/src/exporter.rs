// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Drain loop: pops event records, turns them into spans and submits them to
//! the sink, one at a time.
//!
//! A failed submission is retried with exponential backoff up to
//! [`RetryPolicy::max_retries`] times, then the record is dropped and counted
//! as a failed export. Failures never stop the loop.
//!
//! Shutdown uses two tokens:
//! - `shutdown`: stop waiting for new records. Stopping goes further than
//!   finishing the current item: the loop keeps exporting whatever is already
//!   queued and exits once the queue is empty. The caller bounds this phase
//!   with its drain timeout and then cancels `abandon`.
//! - `abandon`: the drain timeout expired. The in-flight item is given up and
//!   whatever is still queued is discarded and counted as dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::event::EventRecord;
use crate::queue::BoundedQueue;
use crate::sink::SpanSink;
use crate::span::{build_span, DEFAULT_SPAN_NAME_PREFIX};
use crate::stats::PipelineStats;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_RETRY_BACKOFF_BASE: Duration = Duration::from_millis(100);

// Caps the doubling so the shift below never overflows.
const MAX_BACKOFF_DOUBLINGS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per record after the first one fails.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each following retry.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_base: DEFAULT_RETRY_BACKOFF_BASE,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let doublings = retry.saturating_sub(1).min(MAX_BACKOFF_DOUBLINGS);
        self.backoff_base.saturating_mul(1 << doublings)
    }
}

#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub span_name_prefix: String,
    pub retry: RetryPolicy,
    /// Longest the loop waits on an empty queue before checking for shutdown.
    pub poll_interval: Duration,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            span_name_prefix: DEFAULT_SPAN_NAME_PREFIX.to_string(),
            retry: RetryPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Clone)]
pub struct Exporter {
    queue: Arc<BoundedQueue>,
    sink: Arc<dyn SpanSink>,
    stats: Arc<PipelineStats>,
    config: ExporterConfig,
}

impl Exporter {
    pub fn new(
        queue: Arc<BoundedQueue>,
        sink: Arc<dyn SpanSink>,
        stats: Arc<PipelineStats>,
        config: ExporterConfig,
    ) -> Self {
        Self {
            queue,
            sink,
            stats,
            config,
        }
    }

    /// Runs until `shutdown` is cancelled and the backlog is exported, or
    /// until `abandon` is cancelled.
    pub async fn drain_and_export(self, shutdown: CancellationToken, abandon: CancellationToken) {
        debug!("Exporter drain loop started");

        while !shutdown.is_cancelled() {
            // pop_wait only removes a record in the poll that returns it, so
            // losing this race to shutdown never loses a record.
            let next = tokio::select! {
                record = self.queue.pop_wait(self.config.poll_interval) => record,
                () = shutdown.cancelled() => None,
            };
            if let Some(record) = next {
                self.export_or_abandon(record, &abandon).await;
            }
        }

        debug!("Exporter draining {} queued records", self.queue.len());
        while !abandon.is_cancelled() {
            let Some(record) = self.queue.pop() else {
                break;
            };
            self.export_or_abandon(record, &abandon).await;
        }

        let discarded = self.queue.discard_remaining();
        if discarded > 0 {
            warn!("Drain timeout expired with {discarded} records still queued");
        }
        debug!("Exporter drain loop stopped");
    }

    async fn export_or_abandon(&self, record: EventRecord, abandon: &CancellationToken) {
        let source_id = record.source_id();
        tokio::select! {
            () = self.export_one(record) => {}
            () = abandon.cancelled() => {
                self.stats.record_failed_export();
                warn!("Abandoned export of event {source_id} at drain timeout");
            }
        }
    }

    /// Exports a single record, retrying per the retry policy. Outcomes are
    /// recorded in the pipeline counters; nothing is returned.
    pub async fn export_one(&self, record: EventRecord) {
        let span = build_span(&record, &self.config.span_name_prefix);
        let attempts = self.config.retry.max_retries.saturating_add(1);

        for attempt in 1..=attempts {
            match self.sink.submit(span.clone()).await {
                Ok(()) => {
                    self.stats.record_exported();
                    debug!(
                        "Exported event id={} record_id={:?} as span {}",
                        record.source_id(),
                        record.record_id(),
                        span.name
                    );
                    return;
                }
                Err(e) if attempt < attempts => {
                    let backoff = self.config.retry.backoff(attempt);
                    warn!(
                        "Failed to export span {} (attempt {attempt}/{attempts}): {e}, retrying in {backoff:?}",
                        span.name
                    );
                    self.stats.record_retry();
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    self.stats.record_failed_export();
                    error!(
                        "Failed to export span {} after {attempts} attempts, dropping it: {e}",
                        span.name
                    );
                }
            }
        }
    }
}
