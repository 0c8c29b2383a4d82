// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::time::SystemTime;

use crate::event::EventRecord;

pub const DEFAULT_SPAN_NAME_PREFIX: &str = "SysmonEventID_";

pub const ATTR_EVENT_ID: &str = "EventID";
pub const ATTR_PROVIDER_NAME: &str = "ProviderName";
pub const ATTR_LOG_NAME: &str = "LogName";
pub const ATTR_MACHINE_NAME: &str = "MachineName";
pub const ATTR_RECORD_ID: &str = "RecordID";

/// Value of the `RecordID` attribute when the event carries no record id.
pub const MISSING_RECORD_ID: &str = "N/A";

/// A finished span, ready to hand over to a sink.
///
/// Start and end timestamps are carried explicitly so the span can be built
/// long after the event callback that produced it has returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanRecord {
    pub name: String,
    pub attributes: HashMap<String, String>,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
}

impl SpanRecord {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Builds the span for one event. The span starts when the event was
/// written and ends when it was picked up for export.
pub fn build_span(record: &EventRecord, name_prefix: &str) -> SpanRecord {
    let start_time = record.timestamp();
    let end_time = SystemTime::now().max(start_time);

    let attributes = HashMap::from([
        (ATTR_EVENT_ID.to_string(), record.source_id().to_string()),
        (
            ATTR_PROVIDER_NAME.to_string(),
            record.provider_name().to_string(),
        ),
        (ATTR_LOG_NAME.to_string(), record.log_name().to_string()),
        (
            ATTR_MACHINE_NAME.to_string(),
            record.machine_name().to_string(),
        ),
        (
            ATTR_RECORD_ID.to_string(),
            record
                .record_id()
                .map_or_else(|| MISSING_RECORD_ID.to_string(), |id| id.to_string()),
        ),
    ]);

    SpanRecord {
        name: format!("{name_prefix}{}", record.source_id()),
        attributes,
        start_time,
        end_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_build_span_sets_all_attributes() {
        let written = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let record = EventRecord::new(
            4624,
            "Microsoft-Windows-Security-Auditing",
            "Security",
            "HOST01",
            Some(991),
            written,
        );

        let span = build_span(&record, DEFAULT_SPAN_NAME_PREFIX);

        assert_eq!(span.name, "SysmonEventID_4624");
        assert_eq!(span.attribute(ATTR_EVENT_ID), Some("4624"));
        assert_eq!(
            span.attribute(ATTR_PROVIDER_NAME),
            Some("Microsoft-Windows-Security-Auditing")
        );
        assert_eq!(span.attribute(ATTR_LOG_NAME), Some("Security"));
        assert_eq!(span.attribute(ATTR_MACHINE_NAME), Some("HOST01"));
        assert_eq!(span.attribute(ATTR_RECORD_ID), Some("991"));
        assert_eq!(span.attributes.len(), 5);
        assert_eq!(span.start_time, written);
        assert!(span.end_time >= span.start_time);
    }

    #[test]
    fn test_missing_record_id_is_not_available() {
        let record = EventRecord::new(1, "p", "Security", "HOST01", None, SystemTime::now());
        let span = build_span(&record, "Event_");

        assert_eq!(span.name, "Event_1");
        assert_eq!(span.attribute(ATTR_RECORD_ID), Some(MISSING_RECORD_ID));
    }

    #[test]
    fn test_future_timestamp_never_ends_before_start() {
        let future = SystemTime::now() + Duration::from_secs(3600);
        let record = EventRecord::new(1, "p", "Security", "HOST01", None, future);
        let span = build_span(&record, DEFAULT_SPAN_NAME_PREFIX);

        assert_eq!(span.end_time, span.start_time);
    }
}
