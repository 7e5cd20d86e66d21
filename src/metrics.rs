//! Metrics for the continuous query service
//!
//! Recorded through the `metrics` facade and exposed in Prometheus format when the
//! binary installs the exporter.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Initialize the metrics collection system
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    Ok(())
}

/// Record a completed scheduling pass
pub fn record_pass(duration_ms: f64) {
    counter!("vctsdb.cq.passes").increment(1);
    histogram!("vctsdb.cq.pass.duration_ms").record(duration_ms);
}

/// Record a pass that did no work
pub fn record_pass_skipped(reason: &'static str) {
    counter!("vctsdb.cq.pass.skipped", "reason" => reason).increment(1);
}

/// Record a successful window execution
pub fn record_execution(duration_ms: f64, points_written: u64) {
    counter!("vctsdb.cq.executions").increment(1);
    counter!("vctsdb.cq.points_written").increment(points_written);
    histogram!("vctsdb.cq.execution.duration_ms").record(duration_ms);
}

pub fn record_execution_failure() {
    counter!("vctsdb.cq.execution_failures").increment(1);
}

/// Record windows that fell out of the FOR horizon without running
pub fn record_stale_windows(count: u64) {
    counter!("vctsdb.cq.windows.stale").increment(count);
}

pub fn record_definition_error() {
    counter!("vctsdb.cq.definition_errors").increment(1);
}
