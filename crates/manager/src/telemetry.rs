//! Process-level observability wiring: tracing subscriber plus an optional
//! Prometheus scrape endpoint. Called once from the operator's main.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Filtering comes from `RUDDER_LOG`
/// (falling back to `RUST_LOG`, then "info").
pub fn init_tracing() {
    let filter = std::env::var("RUDDER_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .init();
}

/// Install the Prometheus recorder and scrape listener when
/// `RUDDER_METRICS_ADDR` is set (e.g. "0.0.0.0:9090"). Without it, metric
/// macros stay no-ops.
pub fn init_metrics() -> Result<()> {
    let Ok(addr) = std::env::var("RUDDER_METRICS_ADDR") else {
        return Ok(());
    };
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid RUDDER_METRICS_ADDR {addr:?}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("installing prometheus exporter")?;
    info!(%addr, "metrics endpoint listening");
    Ok(())
}
