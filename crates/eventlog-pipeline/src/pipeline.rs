// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline lifecycle.
//!
//! ```text
//! Stopped ──start()──> Starting ──subscribed──> Running
//!    ^                     │                       │
//!    │              subscription failed          stop()
//!    │                     │                       v
//!    └─────────────────────┴──────────────────  Stopping
//! ```
//!
//! `stop()` closes the queue, unsubscribes, lets the drain loop export the
//! backlog for up to `drain_timeout`, abandons whatever is left and flushes
//! the sink.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::exporter::{Exporter, ExporterConfig};
use crate::queue::BoundedQueue;
use crate::sink::SpanSink;
use crate::source::{EventSourceAdapter, EventSubscription};
use crate::stats::{PipelineStats, StatsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            PipelineStatus::Stopped => "stopped",
            PipelineStatus::Starting => "starting",
            PipelineStatus::Running => "running",
            PipelineStatus::Stopping => "stopping",
        };
        f.write_str(status)
    }
}

struct RunningPipeline {
    shutdown: CancellationToken,
    abandon: CancellationToken,
    drain_task: JoinHandle<()>,
}

pub struct Pipeline {
    log_name: String,
    filter_query: String,
    drain_timeout: Duration,
    flush_timeout: Duration,
    exporter_config: ExporterConfig,
    queue: Arc<BoundedQueue>,
    stats: Arc<PipelineStats>,
    sink: Arc<dyn SpanSink>,
    source: Box<dyn EventSubscription>,
    status_tx: watch::Sender<PipelineStatus>,
    running: Option<RunningPipeline>,
}

impl Pipeline {
    pub fn new(
        config: &PipelineConfig,
        source: Box<dyn EventSubscription>,
        sink: Arc<dyn SpanSink>,
    ) -> Self {
        let (status_tx, _) = watch::channel(PipelineStatus::Stopped);
        Self {
            log_name: config.log_name.clone(),
            filter_query: config.filter_query.clone(),
            drain_timeout: config.drain_timeout,
            flush_timeout: config.flush_timeout,
            exporter_config: config.exporter_config(),
            queue: Arc::new(BoundedQueue::new(
                config.queue_capacity,
                config.overflow_policy,
            )),
            stats: Arc::new(PipelineStats::new()),
            sink,
            source,
            status_tx,
            running: None,
        }
    }

    pub fn status(&self) -> PipelineStatus {
        *self.status_tx.borrow()
    }

    /// Receiver that observes every status transition.
    pub fn status_receiver(&self) -> watch::Receiver<PipelineStatus> {
        self.status_tx.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.queue.dropped())
    }

    pub fn queue(&self) -> &Arc<BoundedQueue> {
        &self.queue
    }

    fn set_status(&self, status: PipelineStatus) {
        self.status_tx.send_replace(status);
    }

    /// Starts the drain loop, then subscribes to the event log.
    ///
    /// If the subscription fails the drain loop is cancelled, the pipeline is
    /// back to [`PipelineStatus::Stopped`] and the error is returned.
    pub async fn start(&mut self) -> Result<(), PipelineError> {
        if self.status() != PipelineStatus::Stopped {
            return Err(PipelineError::AlreadyStarted);
        }
        self.set_status(PipelineStatus::Starting);
        info!(
            "Starting event pipeline for log {} with filter '{}'",
            self.log_name, self.filter_query
        );

        self.queue.reopen();
        let shutdown = CancellationToken::new();
        let abandon = CancellationToken::new();
        let exporter = Exporter::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.sink),
            Arc::clone(&self.stats),
            self.exporter_config.clone(),
        );
        let drain_task = tokio::spawn(exporter.drain_and_export(shutdown.clone(), abandon.clone()));

        let adapter = EventSourceAdapter::new(Arc::clone(&self.queue), Arc::clone(&self.stats));
        if let Err(e) = self
            .source
            .subscribe(&self.log_name, &self.filter_query, adapter.callback())
        {
            error!("Failed to subscribe to event log {}: {e}", self.log_name);
            self.queue.close();
            shutdown.cancel();
            abandon.cancel();
            if let Err(join_error) = drain_task.await {
                error!("Exporter task failed: {join_error}");
            }
            self.set_status(PipelineStatus::Stopped);
            return Err(e.into());
        }

        self.running = Some(RunningPipeline {
            shutdown,
            abandon,
            drain_task,
        });
        self.set_status(PipelineStatus::Running);
        info!("Event pipeline running");
        Ok(())
    }

    /// `unsubscribe` may join the source's callback thread, which takes up to
    /// one receive poll interval plus the callback in flight. On a
    /// multi-thread runtime the worker is handed over while it waits.
    fn unsubscribe_source(&mut self) {
        let source = &mut self.source;
        match Handle::try_current().map(|handle| handle.runtime_flavor()) {
            Ok(RuntimeFlavor::MultiThread) => {
                tokio::task::block_in_place(|| source.unsubscribe());
            }
            _ => source.unsubscribe(),
        }
    }

    /// Stops the pipeline. Calling it on a stopped pipeline does nothing.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        self.set_status(PipelineStatus::Stopping);
        info!("Stopping event pipeline");

        // Closed first so a producer blocked on a full queue is released
        // before unsubscribe waits for the callback thread.
        self.queue.close();
        self.unsubscribe_source();
        running.shutdown.cancel();

        let mut drain_task = running.drain_task;
        match tokio::time::timeout(self.drain_timeout, &mut drain_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Exporter task failed: {e}"),
            Err(_) => {
                warn!(
                    "Drain timeout of {:?} expired with {} records queued, abandoning them",
                    self.drain_timeout,
                    self.queue.len()
                );
                running.abandon.cancel();
                if let Err(e) = drain_task.await {
                    error!("Exporter task failed: {e}");
                }
            }
        }

        match tokio::time::timeout(self.flush_timeout, self.sink.flush(self.flush_timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to flush sink: {e}"),
            Err(_) => warn!("Sink flush timed out after {:?}", self.flush_timeout),
        }

        self.set_status(PipelineStatus::Stopped);
        info!("Event pipeline stopped: {}", self.stats());
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            self.queue.close();
            self.unsubscribe_source();
            running.shutdown.cancel();
            running.abandon.cancel();
        }
    }
}
