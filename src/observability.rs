// src/observability.rs
//! Tracing and metrics setup
//!
//! Metrics recorded by the runtime:
//!
//! - `netscript_processes_started_total`
//! - `netscript_processes_terminated_total{reason}`
//! - `netscript_ram_violations_total`
//! - `netscript_concurrency_violations_total`
//! - `netscript_live_processes` (gauge)

use crate::utils::config::{LoggingConfig, MetricsConfig};
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber. `RUST_LOG` overrides the
/// configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| EngineError::ConfigError(format!("invalid log level: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };

    result.map_err(|e| EngineError::RuntimeError(format!("failed to install tracing subscriber: {}", e)))
}

/// Install the Prometheus recorder. Returns a handle that renders the
/// current metrics, or `None` when metrics are disabled.
pub fn init_metrics(config: &MetricsConfig) -> Result<Option<PrometheusHandle>> {
    if !config.enabled {
        return Ok(None);
    }

    PrometheusBuilder::new()
        .install_recorder()
        .map(Some)
        .map_err(|e| EngineError::RuntimeError(format!("failed to install metrics recorder: {}", e)))
}
