// src/observability/mod.rs
//! Observability: tracing subscriber and metrics exporter set-up
//!
//! The library only emits through the `tracing` and `metrics` facades.
//! Binaries decide where the output goes by calling [`init_tracing`] and
//! [`init_metrics`] once at start-up.

pub mod metrics;

use crate::utils::config::{LoggingConfig, MetricsConfig};
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.json {
        registry.with(fmt::layer().json().with_thread_names(true)).try_init()
    } else {
        registry.with(fmt::layer().with_thread_names(true)).try_init()
    };

    installed.map_err(|e| EngineError::ConfigError(format!("tracing init failed: {}", e)))
}

/// Install the Prometheus exporter when enabled
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| EngineError::ConfigError(format!("invalid metrics address: {}", e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::ConfigError(format!("metrics exporter failed: {}", e)))?;

    info!("Prometheus exporter listening on {}", addr);
    Ok(())
}
