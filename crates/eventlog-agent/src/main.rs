// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, path::PathBuf, process::ExitCode, sync::Arc};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

use eventlog_pipeline::{
    config::DEFAULT_LOG_LEVEL,
    get_config,
    sink::OtlpHttpSink,
    source::UdpEventSource,
    Pipeline, PipelineConfig,
};

const CONFIG_DIR_ENV: &str = "EVENTLOG_CONFIG_DIR";
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

#[tokio::main]
pub async fn main() -> ExitCode {
    let filter_handle = match init_logging(DEFAULT_LOG_LEVEL) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to set up logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    let config_dir = env::var(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));
    let config = match get_config(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match env_filter(&config.log_level) {
        Ok(filter) => {
            if let Err(e) = filter_handle.reload(filter) {
                error!("Failed to apply log level {}: {e}", config.log_level);
            }
        }
        Err(e) => error!("Could not parse log level {}: {e}", config.log_level),
    }
    debug!("Logging subsystem enabled");
    log_config(&config);

    let sink = match OtlpHttpSink::new(config.sink_config()) {
        Ok(sink) => sink,
        Err(e) => {
            error!("Failed to create collector client: {e}");
            return ExitCode::FAILURE;
        }
    };
    let source = UdpEventSource::new(config.listen_addr.clone());
    let mut pipeline = Pipeline::new(&config, Box::new(source), Arc::new(sink));

    if let Err(e) = pipeline.start().await {
        error!("Failed to start event pipeline: {e}");
        return ExitCode::FAILURE;
    }

    let mut stats_interval = interval(STATS_LOG_INTERVAL);
    stats_interval.tick().await; // discard first tick, which is instantaneous

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = stats_interval.tick() => {
                info!("Pipeline stats: {}", pipeline.stats());
            }
            () = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    pipeline.stop().await;
    info!("Final pipeline stats: {}", pipeline.stats());
    ExitCode::SUCCESS
}

fn env_filter(level: &str) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    EnvFilter::try_new(format!("h2=off,hyper=off,reqwest=off,rustls=off,{level}"))
}

fn init_logging(level: &str) -> Result<FilterHandle, Box<dyn std::error::Error>> {
    let (filter, handle) = reload::Layer::new(env_filter(level)?);
    let format = fmt::layer()
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .try_init()?;
    Ok(handle)
}

fn log_config(config: &PipelineConfig) {
    info!(
        "Starting event log agent: log={} filter='{}' listen={} collector={} service={}",
        config.log_name,
        config.filter_query,
        config.listen_addr,
        config.collector_endpoint,
        config.service_name
    );
    debug!(
        "Queue capacity={} overflow_policy={:?} max_retries={} drain_timeout={:?}",
        config.queue_capacity, config.overflow_policy, config.max_retries, config.drain_timeout
    );
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!("Failed to listen for ctrl-c: {e}");
                        }
                    }
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {e}"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}
