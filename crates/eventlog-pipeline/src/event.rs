// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event model shared by the source adapter and the exporter.
//!
//! [`RawEvent`] is what the subscription hands over: every field is optional
//! because the OS does not promise any of them. [`EventRecord`] is the
//! normalized, immutable form that travels through the queue.

use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Record properties as delivered by the event log.
///
/// Deserializes from both `snake_case` keys and the `PascalCase` property
/// names event log forwarders usually keep (`Id`, `ProviderName`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawEventRecord {
    #[serde(alias = "Id", alias = "EventID", alias = "event_id")]
    pub id: Option<u32>,
    #[serde(alias = "ProviderName")]
    pub provider_name: Option<String>,
    #[serde(alias = "LogName")]
    pub log_name: Option<String>,
    #[serde(alias = "MachineName")]
    pub machine_name: Option<String>,
    #[serde(alias = "RecordId", alias = "RecordID")]
    pub record_id: Option<u64>,
    /// Milliseconds since the Unix epoch.
    #[serde(alias = "TimeCreated")]
    pub time_created: Option<u64>,
}

/// One delivery from the event subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEvent {
    /// The underlying record, absent when the subscription had nothing to give.
    pub record: Option<RawEventRecord>,
    /// Error reported by the subscription in place of a record.
    pub error: Option<String>,
}

impl RawEvent {
    pub fn new(record: RawEventRecord) -> Self {
        Self {
            record: Some(record),
            error: None,
        }
    }

    /// A delivery without an underlying record.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn delivery_error(error: impl Into<String>) -> Self {
        Self {
            record: None,
            error: Some(error.into()),
        }
    }

    /// Decodes one JSON payload. `null` is a delivery without a record; a
    /// payload that is not a record becomes a delivery error so the adapter
    /// can count it like any other malformed event.
    pub fn from_json(payload: &[u8]) -> Self {
        match serde_json::from_slice::<Option<RawEventRecord>>(payload) {
            Ok(Some(record)) => Self::new(record),
            Ok(None) => Self::empty(),
            Err(e) => Self::delivery_error(format!("undecodable payload: {e}")),
        }
    }
}

/// A normalized event, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    source_id: u32,
    provider_name: String,
    log_name: String,
    machine_name: String,
    record_id: Option<u64>,
    timestamp: SystemTime,
}

impl EventRecord {
    pub fn new(
        source_id: u32,
        provider_name: impl Into<String>,
        log_name: impl Into<String>,
        machine_name: impl Into<String>,
        record_id: Option<u64>,
        timestamp: SystemTime,
    ) -> Self {
        Self {
            source_id,
            provider_name: provider_name.into(),
            log_name: log_name.into(),
            machine_name: machine_name.into(),
            record_id,
            timestamp,
        }
    }

    pub fn source_id(&self) -> u32 {
        self.source_id
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    pub fn machine_name(&self) -> &str {
        &self.machine_name
    }

    pub fn record_id(&self) -> Option<u64> {
        self.record_id
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

// OTLP carries timestamps as u64 nanoseconds since the epoch.
const MAX_TIME_CREATED_MILLIS: u64 = u64::MAX / 1_000_000;

/// `None` when `millis` is past what a span timestamp can carry.
pub(crate) fn system_time_from_millis(millis: u64) -> Option<SystemTime> {
    if millis > MAX_TIME_CREATED_MILLIS {
        return None;
    }
    UNIX_EPOCH.checked_add(Duration::from_millis(millis))
}
