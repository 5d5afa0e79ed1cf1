//! Telemetry: structured logging and the metrics facade.
//!
//! No exporters are bundled; metrics go through the `metrics` facade and
//! logs through `tracing`, with sinks left to the embedding deployment.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Logging already initialized")]
    AlreadyInitialized,
}

/// Initialize the global tracing subscriber. Filter comes from `RUST_LOG`,
/// defaulting to `info`.
pub fn init_logging(format: LogFormat) -> Result<(), LogError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|_| LogError::AlreadyInitialized)
}

/// Register metric metadata. Call once at startup.
pub fn init_metrics() {
    describe_counter!("oobleck_templates_built_total", "Pipeline templates planned");
    describe_histogram!(
        "oobleck_catalogue_build_ms",
        "Template catalogue build latency in milliseconds"
    );
    describe_counter!(
        "oobleck_reconfigurations_total",
        "Completed reconfiguration passes"
    );
    describe_counter!(
        "oobleck_copy_ops_total",
        "Layer-state copies executed during reconfiguration"
    );
    describe_gauge!("oobleck_live_pipelines", "Currently live pipelines");
    describe_histogram!(
        "oobleck_rendezvous_ms",
        "Rendezvous-port protocol latency in milliseconds"
    );
}

pub fn record_catalogue_build(templates_built: usize, elapsed: std::time::Duration) {
    counter!("oobleck_templates_built_total").increment(templates_built as u64);
    histogram!("oobleck_catalogue_build_ms").record(elapsed.as_secs_f64() * 1e3);
}

pub fn record_reconfiguration(copy_ops: usize, live_pipelines: usize) {
    counter!("oobleck_reconfigurations_total").increment(1);
    counter!("oobleck_copy_ops_total").increment(copy_ops as u64);
    gauge!("oobleck_live_pipelines").set(live_pipelines as f64);
}

pub fn record_rendezvous(elapsed: std::time::Duration) {
    histogram!("oobleck_rendezvous_ms").record(elapsed.as_secs_f64() * 1e3);
}
