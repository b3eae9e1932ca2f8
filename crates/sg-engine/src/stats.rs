//! Request monitoring and the read-only reporting snapshots

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;
use utoipa::ToSchema;

use sg_common::{LimiterDiagnostics, SystemState};
use sg_queue::QueueConsumer;

use crate::admission::{round1, AdmissionController};

const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Depth above which the queue is reported as growing
const GROWING_QUEUE_DEPTH: u64 = 100;

/// Depth above which a large-queue hint is added to the recommendations
const LARGE_QUEUE_DEPTH: u64 = 1000;

/// In-process request counters for this server instance
pub struct RequestMonitor {
    total_requests: AtomicU64,
    rate_limited_requests: AtomicU64,
    recent: Mutex<VecDeque<Instant>>,
    started: Instant,
    start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct MonitorSnapshot {
    pub total_requests: u64,
    pub rate_limited_requests: u64,
    /// Requests seen during the trailing second
    pub current_rps: u64,
    pub start_time: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub average_rps: f64,
}

impl RequestMonitor {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            rate_limited_requests: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::new()),
            started: Instant::now(),
            start_time: Utc::now(),
        }
    }

    /// Count one inbound request, accepted or not
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut recent = self.recent.lock();
        recent.push_back(now);
        Self::evict(&mut recent, now);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn evict(recent: &mut VecDeque<Instant>, now: Instant) {
        while recent.front().is_some_and(|t| now.duration_since(*t) >= RATE_WINDOW) {
            recent.pop_front();
        }
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let now = Instant::now();
        let current_rps = {
            let mut recent = self.recent.lock();
            Self::evict(&mut recent, now);
            recent.len() as u64
        };

        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let uptime = now.duration_since(self.started).as_secs_f64();
        let average_rps = if uptime > 0.0 { total_requests as f64 / uptime } else { 0.0 };

        MonitorSnapshot {
            total_requests,
            rate_limited_requests: self.rate_limited_requests.load(Ordering::Relaxed),
            current_rps,
            start_time: self.start_time,
            uptime_seconds: round1(uptime),
            average_rps: (average_rps * 100.0).round() / 100.0,
        }
    }
}

impl Default for RequestMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Monitor counters merged with the limiter diagnostics
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MonitoringSnapshot {
    #[serde(flatten)]
    pub monitor: MonitorSnapshot,
    pub adaptive: LimiterDiagnostics,
    pub recommendations: Vec<String>,
    /// Broker-side view of the dispatch queue; absent when it could not be read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct QueueSnapshot {
    pub name: String,
    /// Jobs waiting for a dispatch worker
    pub pending_jobs: u64,
    /// Jobs held by a worker and not yet acked
    pub in_flight_jobs: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct QueueManagement {
    pub is_queue_growing: bool,
    pub should_reduce_input: bool,
    pub estimated_catchup_minutes: f64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SystemStatus {
    /// healthy or warning
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub details: LimiterDiagnostics,
    pub queue_management: QueueManagement,
}

#[derive(Clone)]
pub struct StatsAggregator {
    admission: Arc<AdmissionController>,
    monitor: Arc<RequestMonitor>,
    queue: Option<Arc<dyn QueueConsumer>>,
}

impl StatsAggregator {
    pub fn new(admission: Arc<AdmissionController>, monitor: Arc<RequestMonitor>) -> Self {
        Self {
            admission,
            monitor,
            queue: None,
        }
    }

    /// Include the dispatch queue's own depth in monitoring snapshots
    pub fn with_queue(mut self, queue: Arc<dyn QueueConsumer>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub async fn snapshot(&self) -> MonitoringSnapshot {
        let adaptive = self.admission.diagnostics().await;
        MonitoringSnapshot {
            monitor: self.monitor.snapshot(),
            recommendations: recommendations(&adaptive),
            adaptive,
            queue: self.queue_snapshot().await,
        }
    }

    async fn queue_snapshot(&self) -> Option<QueueSnapshot> {
        let queue = self.queue.as_ref()?;
        match queue.get_metrics().await {
            Ok(metrics) => Some(QueueSnapshot {
                name: metrics.queue_identifier,
                pending_jobs: metrics.pending_jobs,
                in_flight_jobs: metrics.in_flight_jobs,
            }),
            Err(e) => {
                warn!(queue = %queue.identifier(), error = %e, "Failed to read queue metrics");
                None
            }
        }
    }

    pub async fn system_status(&self) -> SystemStatus {
        let details = self.admission.diagnostics().await;
        let healthy = matches!(details.system_state, Some(SystemState::Normal | SystemState::Busy));
        let queue_management = QueueManagement {
            is_queue_growing: details.queue_size > GROWING_QUEUE_DEPTH,
            should_reduce_input: matches!(
                details.system_state,
                Some(SystemState::Overloaded | SystemState::Critical)
            ),
            estimated_catchup_minutes: details.estimated_wait_minutes,
        };

        SystemStatus {
            status: if healthy { "healthy" } else { "warning" }.to_string(),
            timestamp: Utc::now(),
            details,
            queue_management,
        }
    }
}

/// Operator hints for the current load state
pub fn recommendations(diag: &LimiterDiagnostics) -> Vec<String> {
    let limit = diag.current_input_limit.unwrap_or(0);
    let mut hints = match diag.system_state {
        Some(SystemState::Normal) => vec!["System operating normally".to_string()],
        Some(SystemState::Busy) => vec![format!("System busy: input rate reduced to {limit} RPS")],
        Some(SystemState::Overloaded) => vec![
            format!("System overloaded: input rate reduced to {limit} RPS"),
            format!("Current wait time: {:.1} minutes", diag.estimated_wait_minutes),
        ],
        Some(SystemState::Critical) => vec![
            format!("System critical: input rate limited to {limit} RPS"),
            "Long wait times expected".to_string(),
            "Consider scaling downstream capacity".to_string(),
        ],
        None => vec!["Counter store unreachable: load state unknown, admitting without limits".to_string()],
    };

    if diag.queue_size > LARGE_QUEUE_DEPTH {
        hints.push(format!("Large queue detected: {} requests pending", diag.queue_size));
    }
    hints
}
