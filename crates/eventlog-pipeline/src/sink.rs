// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry sinks.
//!
//! A [`SpanSink`] takes ownership of finished spans. The exporter is the only
//! caller and never holds the queue lock while a submission is in flight.
//!
//! [`OtlpHttpSink`] ships each span to an OpenTelemetry collector as an
//! OTLP/HTTP JSON `ExportTraceServiceRequest` on `{endpoint}/v1/traces`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::errors::SinkSubmissionError;
use crate::span::SpanRecord;

pub const DEFAULT_COLLECTOR_ENDPOINT: &str = "http://localhost:4318";
pub const DEFAULT_SERVICE_NAME: &str = "WindowsAgent";
pub const DEFAULT_SCOPE_NAME: &str = "MyAgentTracer";

const TRACES_PATH: &str = "/v1/traces";
// SPAN_KIND_INTERNAL
const SPAN_KIND: u8 = 1;

#[async_trait]
pub trait SpanSink: Send + Sync {
    /// Hands one span to the sink. An error means the span was not accepted.
    async fn submit(&self, span: SpanRecord) -> Result<(), SinkSubmissionError>;

    /// Pushes out anything the sink buffers internally, giving up after
    /// `timeout`. Sinks without a buffer have nothing to do.
    async fn flush(&self, _timeout: Duration) -> Result<(), SinkSubmissionError> {
        Ok(())
    }
}

/// Settings passed through to the collector sink untouched.
#[derive(Debug, Clone)]
pub struct OtlpSinkConfig {
    pub endpoint: String,
    pub service_name: String,
    pub scope_name: String,
    /// Timeout for each HTTP request.
    pub timeout: Duration,
}

impl Default for OtlpSinkConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_COLLECTOR_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            scope_name: DEFAULT_SCOPE_NAME.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OtlpHttpSink {
    client: reqwest::Client,
    traces_url: String,
    service_name: String,
    scope_name: String,
    timeout: Duration,
}

impl OtlpHttpSink {
    pub fn new(config: OtlpSinkConfig) -> Result<Self, SinkSubmissionError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SinkSubmissionError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            traces_url: traces_url(&config.endpoint),
            service_name: config.service_name,
            scope_name: config.scope_name,
            timeout: config.timeout,
        })
    }

    pub fn traces_url(&self) -> &str {
        &self.traces_url
    }

    fn encode(&self, span: &SpanRecord) -> Value {
        let mut attributes: Vec<(&String, &String)> = span.attributes.iter().collect();
        attributes.sort();
        let attributes: Vec<Value> = attributes
            .into_iter()
            .map(|(key, value)| string_attribute(key, value))
            .collect();

        json!({
            "resourceSpans": [{
                "resource": {
                    "attributes": [string_attribute("service.name", &self.service_name)]
                },
                "scopeSpans": [{
                    "scope": { "name": self.scope_name },
                    "spans": [{
                        "traceId": uuid::Uuid::new_v4().simple().to_string(),
                        "spanId": span_id(),
                        "name": span.name,
                        "kind": SPAN_KIND,
                        "startTimeUnixNano": unix_nanos(span.start_time).to_string(),
                        "endTimeUnixNano": unix_nanos(span.end_time).to_string(),
                        "attributes": attributes,
                    }]
                }]
            }]
        })
    }
}

#[async_trait]
impl SpanSink for OtlpHttpSink {
    async fn submit(&self, span: SpanRecord) -> Result<(), SinkSubmissionError> {
        let body = serde_json::to_vec(&self.encode(&span))
            .map_err(|e| SinkSubmissionError::Payload(e.to_string()))?;

        let response = self
            .client
            .post(&self.traces_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SinkSubmissionError::Timeout(self.timeout)
                } else {
                    SinkSubmissionError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            debug!("Exported span {} to {}", span.name, self.traces_url);
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(SinkSubmissionError::Status(status.as_u16(), body))
        }
    }
}

fn traces_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.ends_with(TRACES_PATH) {
        endpoint.to_string()
    } else {
        format!("{endpoint}{TRACES_PATH}")
    }
}

fn string_attribute(key: &str, value: &str) -> Value {
    json!({ "key": key, "value": { "stringValue": value } })
}

fn span_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..16].to_string()
}

fn unix_nanos(time: SystemTime) -> u128 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}
