//! Adaptive Admission Controller
//!
//! Counts admission attempts in fixed windows keyed by wall-clock second and
//! admits while the count stays within the rate allowed for the current load
//! state. The allowed rate shrinks as backlog depth grows.
//!
//! When the counter store is unreachable the controller fails open: every
//! request is admitted and the decision is marked degraded.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use sg_common::{AdmissionStats, LimiterDiagnostics, StoreStatus};
use sg_config::AdmissionConfig;
use sg_store::{CounterKeys, CounterStore};

use crate::backlog::BacklogTracker;
use crate::classifier::Classifier;
use crate::metrics;

/// Outcome of one admission attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    Accepted { stats: AdmissionStats },
    Rejected { reason: String, stats: AdmissionStats },
}

impl AdmissionDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AdmissionDecision::Accepted { .. })
    }

    pub fn stats(&self) -> &AdmissionStats {
        match self {
            AdmissionDecision::Accepted { stats } | AdmissionDecision::Rejected { stats, .. } => stats,
        }
    }
}

pub struct AdmissionController {
    store: Arc<dyn CounterStore>,
    keys: CounterKeys,
    classifier: Classifier,
    backlog: BacklogTracker,
    window_secs: u64,
    output_rps: u32,
    max_queue_size: u64,
}

impl AdmissionController {
    pub fn new(
        store: Arc<dyn CounterStore>,
        keys: CounterKeys,
        config: &AdmissionConfig,
        output_rps: u32,
    ) -> Self {
        let backlog = BacklogTracker::new(store.clone(), &keys);
        Self {
            store,
            keys,
            classifier: Classifier::from_config(config),
            backlog,
            window_secs: config.window_secs.max(1),
            output_rps: output_rps.max(1),
            max_queue_size: config.max_queue_size.max(1),
        }
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn backlog(&self) -> &BacklogTracker {
        &self.backlog
    }

    pub fn output_rps(&self) -> u32 {
        self.output_rps
    }

    /// Decide on one inbound request using the current wall-clock second
    pub async fn try_admit(&self) -> AdmissionDecision {
        self.try_admit_at(Utc::now().timestamp().max(0) as u64).await
    }

    /// Decide on one inbound request as if the clock read `unix_secs`
    pub async fn try_admit_at(&self, unix_secs: u64) -> AdmissionDecision {
        let depth = match self.backlog.read().await {
            Ok(depth) => depth,
            Err(e) => return self.fail_open(e.store_detail()),
        };
        let (state, limit) = self.classifier.limit_for_depth(depth);

        let window_start = unix_secs - unix_secs % self.window_secs;
        let window_key = self.keys.input_window(window_start);
        let count = match self
            .store
            .incr_with_expiry(&window_key, Duration::from_secs(self.window_secs))
            .await
        {
            Ok(count) => count.max(0) as u64,
            Err(e) => return self.fail_open(e.to_string()),
        };

        let mut stats = AdmissionStats {
            store_status: StoreStatus::Connected,
            system_state: Some(state),
            current_input_rps: Some(count),
            input_limit: Some(limit),
            queue_size: Some(depth),
            error: None,
        };

        if count > limit as u64 {
            metrics::record_admission("rejected");
            let reason = format!("Input rate limit exceeded: {count}/{limit} RPS");
            debug!(count, limit, state = %state, depth, "Request rejected");
            return AdmissionDecision::Rejected { reason, stats };
        }

        // Admitted even if the depth update fails; the stats say so
        if let Err(e) = self.backlog.increment().await {
            warn!(error = %e, "Admitted request but failed to increment backlog depth");
            metrics::record_store_degraded("backlog");
            stats.store_status = StoreStatus::Degraded;
            stats.error = Some(e.store_detail());
        }

        metrics::record_admission("accepted");
        AdmissionDecision::Accepted { stats }
    }

    fn fail_open(&self, error: String) -> AdmissionDecision {
        warn!(error = %error, "Counter store unreachable, admitting without limit");
        metrics::record_admission("fail_open");
        metrics::record_store_degraded("admission");
        AdmissionDecision::Accepted {
            stats: AdmissionStats::degraded(error),
        }
    }

    /// Read-only projection of the limiter state
    pub async fn diagnostics(&self) -> LimiterDiagnostics {
        match self.backlog.read().await {
            Ok(depth) => {
                let (state, limit) = self.classifier.limit_for_depth(depth);
                let wait_seconds = depth as f64 / self.output_rps as f64;
                LimiterDiagnostics {
                    store_status: StoreStatus::Connected,
                    queue_size: depth,
                    system_state: Some(state),
                    current_input_limit: Some(limit),
                    output_rps: self.output_rps,
                    estimated_wait_seconds: round1(wait_seconds),
                    estimated_wait_minutes: round1(wait_seconds / 60.0),
                    max_queue_size: self.max_queue_size,
                    queue_utilization_percent: round1(depth as f64 / self.max_queue_size as f64 * 100.0),
                    error: None,
                }
            }
            Err(e) => LimiterDiagnostics {
                store_status: StoreStatus::Degraded,
                queue_size: 0,
                system_state: None,
                current_input_limit: None,
                output_rps: self.output_rps,
                estimated_wait_seconds: 0.0,
                estimated_wait_minutes: 0.0,
                max_queue_size: self.max_queue_size,
                queue_utilization_percent: 0.0,
                error: Some(e.store_detail()),
            },
        }
    }
}

/// Round to one decimal place
pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
