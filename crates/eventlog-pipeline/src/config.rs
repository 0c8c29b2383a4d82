// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline configuration.
//!
//! [`PipelineConfig`] starts from defaults and is overridden, in order, by
//! `eventlog.yaml` in the config directory and then by `EVENTLOG_*`
//! environment variables. Each layer is a [`ConfigSource`]; a source that
//! fails to load is logged and skipped.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, error};

use crate::errors::ConfigError;
use crate::exporter::{
    ExporterConfig, RetryPolicy, DEFAULT_POLL_INTERVAL, DEFAULT_RETRY_BACKOFF_BASE,
};
use crate::queue::{OverflowPolicy, DEFAULT_QUEUE_CAPACITY};
use crate::sink::{
    OtlpSinkConfig, DEFAULT_COLLECTOR_ENDPOINT, DEFAULT_SCOPE_NAME, DEFAULT_SERVICE_NAME,
};
use crate::span::DEFAULT_SPAN_NAME_PREFIX;

pub const CONFIG_FILE_NAME: &str = "eventlog.yaml";
pub const ENV_PREFIX: &str = "EVENTLOG_";

pub const DEFAULT_LOG_NAME: &str = "Security";
pub const DEFAULT_FILTER_QUERY: &str = "*";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5140";
pub const DEFAULT_LOG_LEVEL: &str = "info";

const OTEL_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const OTEL_SERVICE_NAME_ENV: &str = "OTEL_SERVICE_NAME";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub max_retries: u32,
    pub retry_backoff_base: Duration,
    pub poll_interval: Duration,
    /// How long `stop` waits for the backlog to be exported.
    pub drain_timeout: Duration,
    pub flush_timeout: Duration,
    /// Per-request timeout of the collector sink.
    pub export_timeout: Duration,
    pub collector_endpoint: String,
    pub service_name: String,
    pub scope_name: String,
    pub span_name_prefix: String,
    pub log_name: String,
    pub filter_query: String,
    /// Where the UDP event source listens.
    pub listen_addr: String,
    pub log_level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            max_retries: 0,
            retry_backoff_base: DEFAULT_RETRY_BACKOFF_BASE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            drain_timeout: Duration::from_secs(5),
            flush_timeout: Duration::from_secs(5),
            export_timeout: Duration::from_secs(10),
            collector_endpoint: DEFAULT_COLLECTOR_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            scope_name: DEFAULT_SCOPE_NAME.to_string(),
            span_name_prefix: DEFAULT_SPAN_NAME_PREFIX.to_string(),
            log_name: DEFAULT_LOG_NAME.to_string(),
            filter_query: DEFAULT_FILTER_QUERY.to_string(),
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.collector_endpoint.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "collector_endpoint must not be empty".to_string(),
            ));
        }
        if self.log_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "log_name must not be empty".to_string(),
            ));
        }
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "service_name must not be empty".to_string(),
            ));
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidValue(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: self.retry_backoff_base,
        }
    }

    pub fn exporter_config(&self) -> ExporterConfig {
        ExporterConfig {
            span_name_prefix: self.span_name_prefix.clone(),
            retry: self.retry_policy(),
            poll_interval: self.poll_interval,
        }
    }

    pub fn sink_config(&self) -> OtlpSinkConfig {
        OtlpSinkConfig {
            endpoint: self.collector_endpoint.clone(),
            service_name: self.service_name.clone(),
            scope_name: self.scope_name.clone(),
            timeout: self.export_timeout,
        }
    }
}

/// Partial configuration as read from a file or the environment. Every field
/// is optional; unset fields leave the current value alone.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigOverrides {
    #[serde(deserialize_with = "deserialize_option_lossless")]
    queue_capacity: Option<usize>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    overflow_policy: Option<OverflowPolicy>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    max_retries: Option<u32>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_millis")]
    retry_backoff_base_ms: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_millis")]
    poll_interval_ms: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_millis")]
    drain_timeout_ms: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_millis")]
    flush_timeout_ms: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_millis")]
    export_timeout_ms: Option<Duration>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    collector_endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    service_name: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    scope_name: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    span_name_prefix: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    log_name: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    filter_query: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    listen_addr: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    log_level: Option<String>,
}

macro_rules! merge_fields {
    ($config:expr, $overrides:expr, $( $field:ident => $target:ident ),* $(,)?) => {
        $(
            if let Some(value) = &$overrides.$field {
                $config.$target = value.clone();
            }
        )*
    };
}

fn merge_config(config: &mut PipelineConfig, overrides: &ConfigOverrides) {
    merge_fields!(config, overrides,
        queue_capacity => queue_capacity,
        overflow_policy => overflow_policy,
        max_retries => max_retries,
        retry_backoff_base_ms => retry_backoff_base,
        poll_interval_ms => poll_interval,
        drain_timeout_ms => drain_timeout,
        flush_timeout_ms => flush_timeout,
        export_timeout_ms => export_timeout,
        collector_endpoint => collector_endpoint,
        service_name => service_name,
        scope_name => scope_name,
        span_name_prefix => span_name_prefix,
        log_name => log_name,
        filter_query => filter_query,
        listen_addr => listen_addr,
    );
    if let Some(level) = &overrides.log_level {
        config.log_level = level.trim().to_lowercase();
    }
}

pub trait ConfigSource {
    fn load(&self, config: &mut PipelineConfig) -> Result<(), ConfigError>;
}

#[derive(Debug, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct YamlConfigSource {
    pub path: PathBuf,
}

impl ConfigSource for YamlConfigSource {
    fn load(&self, config: &mut PipelineConfig) -> Result<(), ConfigError> {
        // A missing file is an empty provider, not an error.
        let figment = Figment::new().merge(Yaml::file(self.path.clone()));

        let overrides = figment.extract::<ConfigOverrides>().map_err(|e| {
            ConfigError::ParseError(format!("Failed to parse config from yaml file: {e}"))
        })?;
        merge_config(config, &overrides);
        Ok(())
    }
}

/// `EVENTLOG_*` variables, with the standard OpenTelemetry variables as
/// fallbacks for the collector endpoint and service name.
#[derive(Debug, Clone, Copy, Default)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn load(&self, config: &mut PipelineConfig) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Env::prefixed(ENV_PREFIX));

        let mut overrides = figment.extract::<ConfigOverrides>().map_err(|e| {
            ConfigError::ParseError(format!("Failed to parse config from environment: {e}"))
        })?;

        if overrides.collector_endpoint.is_none() {
            overrides.collector_endpoint = non_empty_env(OTEL_ENDPOINT_ENV);
        }
        if overrides.service_name.is_none() {
            overrides.service_name = non_empty_env(OTEL_SERVICE_NAME_ENV);
        }

        merge_config(config, &overrides);
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Default)]
#[allow(clippy::module_name_repetitions)]
pub struct ConfigBuilder {
    sources: Vec<Box<dyn ConfigSource>>,
    config: PipelineConfig,
}

#[allow(clippy::module_name_repetitions)]
impl ConfigBuilder {
    #[must_use]
    pub fn add_source(mut self, source: Box<dyn ConfigSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn build(&mut self) -> PipelineConfig {
        let mut failed_sources = 0;
        for source in &self.sources {
            if let Err(e) = source.load(&mut self.config) {
                error!("Failed to load config: {e}");
                failed_sources += 1;
            }
        }

        if !self.sources.is_empty() && failed_sources == self.sources.len() {
            debug!("All sources failed to load config, using default config.");
        }

        self.config.clone()
    }
}

/// Loads defaults, then `eventlog.yaml` from `config_directory`, then the
/// environment, and validates the result.
pub fn get_config(config_directory: &Path) -> Result<PipelineConfig, ConfigError> {
    let path = config_directory.join(CONFIG_FILE_NAME);
    let config = ConfigBuilder::default()
        .add_source(Box::new(YamlConfigSource { path }))
        .add_source(Box::new(EnvConfigSource))
        .build();
    config.validate()?;
    Ok(config)
}

fn deserialize_option_lossless<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    match Option::<T>::deserialize(deserializer) {
        Ok(value) => Ok(value),
        Err(e) => {
            error!("Failed to deserialize optional value: {e}, ignoring");
            Ok(None)
        }
    }
}

fn deserialize_string_or_int<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => {
            error!("Failed to parse value, expected a string or an integer, ignoring");
            Ok(None)
        }
    }
}

fn deserialize_optional_duration_from_millis<'de, D>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => match n.as_u64() {
            Some(millis) => Ok(Some(Duration::from_millis(millis))),
            None => {
                error!("Failed to parse duration {n}, expected milliseconds, ignoring");
                Ok(None)
            }
        },
        Value::String(s) => match s.trim().parse::<u64>() {
            Ok(millis) => Ok(Some(Duration::from_millis(millis))),
            Err(_) => {
                error!("Failed to parse duration '{s}', expected milliseconds, ignoring");
                Ok(None)
            }
        },
        _ => {
            error!("Failed to parse duration, expected milliseconds, ignoring");
            Ok(None)
        }
    }
}
