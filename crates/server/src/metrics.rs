//! Prometheus exposition of the job counters.
//!
//! `jobcast-server-jobs` records through the `metrics` facade; this module
//! installs the recorder those calls land in and renders it for `/metrics`.

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the process-wide recorder. Job metrics recorded before this call
/// are lost. Returns `false` when a recorder was already installed.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        return false;
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    if metrics::set_global_recorder(recorder).is_err() {
        tracing::warn!("metrics recorder already installed, job metrics not exported");
        return false;
    }

    if PROMETHEUS_HANDLE.set(handle).is_err() {
        tracing::warn!("prometheus handle already stored");
    }

    describe_metrics();

    tracing::info!("job metrics exported at /metrics");
    true
}

fn describe_metrics() {
    describe_counter!("jobs_started_total", "Jobs that entered the Running state");
    describe_counter!(
        "jobs_finished_total",
        "Jobs that reached a terminal state, labelled by status"
    );
    describe_gauge!("jobs_running", "Jobs currently running");
    describe_counter!(
        "job_events_published_total",
        "Events published on the job event bus, labelled by kind"
    );
    describe_counter!(
        "job_bus_gaps_total",
        "Subscribers dropped because their queue overflowed"
    );
    describe_gauge!("job_bus_subscribers", "Current event bus subscribers");
}

/// Prometheus text for `/metrics`, or `None` before [`init_metrics`].
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}
