//! Spiderpool Metrics - metric names, counters, and the async-gauge
//! abstraction published to a Prometheus pull endpoint.

pub mod gauge;
pub mod names;

pub use gauge::{AsyncGauge, DurationRecorder, GaugePublisher};
pub use names::*;

use metrics_exporter_prometheus::PrometheusBuilder;
use miette::Diagnostic;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum MetricError {
    #[error("failed to install metrics exporter: {message}")]
    #[diagnostic(
        code(spiderpool::metric_init),
        help("Check that the metric HTTP port is free")
    )]
    Install { message: String },
}

/// Install the Prometheus exporter with a pull endpoint on `addr` and
/// register descriptions for every metric name.
///
/// Must be called from within a tokio runtime; the exporter serves
/// `GET /metrics` on the given address.
pub fn init_metrics(addr: SocketAddr) -> Result<(), MetricError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricError::Install {
            message: e.to_string(),
        })?;

    names::describe_all();
    tracing::info!("Metrics exporter listening on {}", addr);
    Ok(())
}

/// Register metric descriptions without an exporter (used by tests and
/// metric-disabled deployments; recording becomes a no-op).
pub fn init_metrics_disabled() {
    names::describe_all();
}
