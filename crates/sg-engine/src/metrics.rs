//! Metrics for the admission and dispatch core
//!
//! Prometheus-compatible metrics for:
//! - Admission decisions
//! - Backlog depth and clamp anomalies
//! - Dispatch outcomes and downstream latency
//! - Pacer waits
//! - Counter store degradation per component

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Register descriptions with the installed recorder
pub fn describe_metrics() {
    describe_counter!("sg_admissions_total", "Admission decisions by outcome");
    describe_gauge!("sg_backlog_depth", "Admitted requests not yet terminal");
    describe_counter!("sg_backlog_clamped_total", "Backlog decrements clamped at zero");
    describe_counter!("sg_dispatch_total", "Dispatch outcomes");
    describe_histogram!("sg_downstream_duration_seconds", "Duration of one downstream attempt");
    describe_histogram!("sg_pacer_wait_seconds", "Time workers waited for a pacer slot");
    describe_counter!("sg_store_degraded_total", "Operations that fell back because the counter store was unreachable");
    describe_counter!("sg_housekeeping_runs_total", "Housekeeping sweeps");
    describe_counter!("sg_housekeeping_deleted_keys_total", "Admission window keys removed by housekeeping");
}

/// Record an admission decision (`accepted`, `rejected`, `fail_open`)
pub fn record_admission(outcome: &str) {
    counter!("sg_admissions_total", "outcome" => outcome.to_string()).increment(1);
}

/// Update the backlog depth gauge
pub fn set_backlog_depth(depth: u64) {
    gauge!("sg_backlog_depth").set(depth as f64);
}

/// Record a decrement that had to be clamped at zero
pub fn record_backlog_clamped() {
    counter!("sg_backlog_clamped_total").increment(1);
}

/// Record a dispatch outcome (`completed`, `failed`, `skipped`, `abandoned`)
pub fn record_dispatch(outcome: &str) {
    counter!("sg_dispatch_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record one downstream attempt's latency
pub fn record_downstream_latency(duration: Duration, success: bool) {
    histogram!(
        "sg_downstream_duration_seconds",
        "success" => success.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record time a worker spent waiting on the output pacer
pub fn record_pacer_wait(wait: Duration, degraded: bool) {
    histogram!(
        "sg_pacer_wait_seconds",
        "degraded" => degraded.to_string()
    )
    .record(wait.as_secs_f64());
}

/// Record a component falling back to its degraded path
pub fn record_store_degraded(component: &str) {
    counter!("sg_store_degraded_total", "component" => component.to_string()).increment(1);
}

/// Record a housekeeping sweep and how many keys it removed
pub fn record_housekeeping(deleted: u64) {
    counter!("sg_housekeeping_runs_total").increment(1);
    counter!("sg_housekeeping_deleted_keys_total").increment(deleted);
}
