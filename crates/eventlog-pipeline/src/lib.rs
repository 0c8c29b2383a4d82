// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event log to trace span pipeline.
//!
//! Events delivered by an [`source::EventSubscription`] are normalized and
//! pushed into a [`queue::BoundedQueue`]; an [`exporter::Exporter`] drains the
//! queue on the tokio runtime, turns each record into a span and submits it to
//! a [`sink::SpanSink`]. [`pipeline::Pipeline`] owns the lifecycle.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod errors;
pub mod event;
pub mod exporter;
pub mod pipeline;
pub mod queue;
pub mod sink;
pub mod source;
pub mod span;
pub mod stats;

pub use config::{get_config, PipelineConfig};
pub use pipeline::{Pipeline, PipelineStatus};
pub use stats::StatsSnapshot;
