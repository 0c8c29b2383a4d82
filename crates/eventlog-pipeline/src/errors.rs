// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the pipeline.
//!
//! Only [`SubscriptionError`] (wrapped in [`PipelineError`]) is fatal. The other
//! errors are recovered where they happen and surface as counters and log lines.

use std::time::Duration;

/// A raw event that could not be turned into an `EventRecord`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedEventError {
    #[error("raw event carries no underlying record")]
    MissingRecord,
    #[error("event subscription delivered an error: {0}")]
    Delivery(String),
    #[error("raw event is missing required field `{0}`")]
    MissingField(&'static str),
}

/// Describes a record the queue had to give up on. Never fatal: the record is
/// counted in the drop counter and the pipeline keeps going.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueOverflowError {
    #[error("queue full ({capacity} items), dropped oldest record")]
    DroppedOldest { capacity: usize },
    #[error("queue full ({capacity} items), dropped incoming record")]
    DroppedNewest { capacity: usize },
    #[error("queue closed, dropped incoming record")]
    Closed,
}

/// The sink refused or failed to accept a span.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkSubmissionError {
    #[error("collector answered with status {0}: {1}")]
    Status(u16, String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("could not encode payload: {0}")]
    Payload(String),
    #[error("submission timed out after {0:?}")]
    Timeout(Duration),
}

/// The event log subscription could not be established.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("invalid filter query `{query}`: {reason}")]
    InvalidFilter { query: String, reason: String },
    #[error("failed to bind event source on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("event source is already subscribed")]
    AlreadySubscribed,
    #[error("failed to start event source: {0}")]
    Start(String),
}

/// Errors returned by the pipeline lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline already started")]
    AlreadyStarted,
    #[error("event subscription failed: {0}")]
    Subscription(#[from] SubscriptionError),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    ParseError(String),
    #[error("invalid configuration: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = MalformedEventError::MissingField("ProviderName");
        assert_eq!(
            error.to_string(),
            "raw event is missing required field `ProviderName`"
        );

        let error = SinkSubmissionError::Status(503, "unavailable".to_string());
        assert_eq!(
            error.to_string(),
            "collector answered with status 503: unavailable"
        );
    }

    #[test]
    fn test_subscription_error_converts_into_pipeline_error() {
        let error: PipelineError = SubscriptionError::AlreadySubscribed.into();
        assert!(matches!(error, PipelineError::Subscription(_)));
        assert_eq!(
            error.to_string(),
            "event subscription failed: event source is already subscribed"
        );
    }
}
