//! Dispatch Worker
//!
//! Owns one admitted request from dequeue to terminal status:
//!
//! 1. Skip jobs whose record is already terminal (queue redelivery).
//! 2. Mark the record `processing` (best-effort).
//! 3. Up to `max_attempts` times: wait for a pacer slot, call the downstream
//!    under a time limit, stop on the first success.
//! 4. Persist the final result as `completed` or `failed` (best-effort).
//! 5. Release one unit of backlog depth, whatever happened above.
//!
//! Intermediate attempt failures are only logged; persisting them would need
//! a `failed -> completed` back-transition when a later attempt succeeds.

use futures::FutureExt;
use serde_json::{json, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use sg_common::{QueuedJob, RequestStatus};
use sg_config::{DispatchConfig, QueueConfig};
use sg_records::RecordStore;

use crate::backlog::BacklogTracker;
use crate::downstream::Downstream;
use crate::error::EngineError;
use crate::housekeeping::Housekeeper;
use crate::metrics;
use crate::pacer::OutputPacer;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_attempts: u32,
    pub call_timeout: Duration,
    pub retry_delay: Duration,
    /// Deliveries after which a job is failed without another attempt
    pub max_deliveries: u32,
}

impl WorkerConfig {
    pub fn from_config(dispatch: &DispatchConfig, queue: &QueueConfig) -> Self {
        Self {
            max_attempts: dispatch.max_attempts.max(1),
            call_timeout: Duration::from_millis(dispatch.call_timeout_ms),
            retry_delay: Duration::from_millis(dispatch.retry_delay_ms),
            max_deliveries: queue.max_deliveries.max(1),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default(), &QueueConfig::default())
    }
}

/// How the worker finished with a job. Every variant means the job can be acked.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Completed { attempts: u32 },
    Failed { attempts: u32, error: String },
    /// The record was already terminal; nothing was done
    Skipped { status: RequestStatus },
    /// The queue delivered the job too many times; failed without calling downstream
    Abandoned { deliveries: u32 },
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Completed { .. } => "completed",
            DispatchOutcome::Failed { .. } => "failed",
            DispatchOutcome::Skipped { .. } => "skipped",
            DispatchOutcome::Abandoned { .. } => "abandoned",
        }
    }
}

enum AttemptsResult {
    Succeeded { result: Value, attempts: u32 },
    Exhausted { error: String, attempts: u32 },
}

pub struct DispatchWorker {
    records: Arc<dyn RecordStore>,
    downstream: Arc<dyn Downstream>,
    pacer: OutputPacer,
    backlog: BacklogTracker,
    housekeeper: Housekeeper,
    config: WorkerConfig,
}

impl DispatchWorker {
    pub fn new(
        records: Arc<dyn RecordStore>,
        downstream: Arc<dyn Downstream>,
        pacer: OutputPacer,
        backlog: BacklogTracker,
        housekeeper: Housekeeper,
        config: WorkerConfig,
    ) -> Self {
        Self {
            records,
            downstream,
            pacer,
            backlog,
            housekeeper,
            config,
        }
    }

    pub async fn process(&self, queued: &QueuedJob) -> DispatchOutcome {
        let job = &queued.job;
        let id = job.request_id.as_str();

        match self.records.get(id).await {
            Ok(Some(record)) if record.status.is_terminal() => {
                info!(request_id = %id, status = %record.status, "Record already terminal, skipping redelivered job");
                metrics::record_dispatch("skipped");
                return DispatchOutcome::Skipped { status: record.status };
            }
            Ok(_) => {}
            Err(e) => warn!(request_id = %id, error = %e, "Could not read record before dispatch, processing anyway"),
        }

        let outcome = if queued.receive_count > self.config.max_deliveries {
            let deliveries = queued.receive_count - 1;
            warn!(request_id = %id, deliveries, "Job exceeded delivery limit, failing without dispatch");
            let result = json!({ "error": format!("abandoned after {deliveries} deliveries") });
            self.persist_result(id, &result, RequestStatus::Failed).await;
            DispatchOutcome::Abandoned { deliveries }
        } else {
            info!(request_id = %id, sequence = job.sequence_number, "Processing request");
            self.mark_processing(id).await;

            // A panic anywhere below must still release backlog depth
            match AssertUnwindSafe(self.dispatch(id, &job.payload)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let error = panic_message(panic.as_ref());
                    error!(request_id = %id, error = %error, "Dispatch panicked");
                    DispatchOutcome::Failed { attempts: 0, error }
                }
            }
        };

        self.release(id).await;
        metrics::record_dispatch(outcome.label());

        if self.housekeeper.is_due(job.sequence_number) {
            self.housekeeper.spawn_sweep();
        }

        outcome
    }

    async fn dispatch(&self, id: &str, payload: &Value) -> DispatchOutcome {
        match self.run_attempts(id, payload).await {
            AttemptsResult::Succeeded { result, attempts } => {
                self.persist_result(id, &result, RequestStatus::Completed).await;
                info!(request_id = %id, attempts, "Request completed");
                DispatchOutcome::Completed { attempts }
            }
            AttemptsResult::Exhausted { error, attempts } => {
                let result = json!({ "error": error, "attempts": attempts });
                self.persist_result(id, &result, RequestStatus::Failed).await;
                error!(request_id = %id, attempts, error = %error, "Request failed after all attempts");
                DispatchOutcome::Failed { attempts, error }
            }
        }
    }

    async fn run_attempts(&self, id: &str, payload: &Value) -> AttemptsResult {
        let max_attempts = self.config.max_attempts;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            self.pacer.wait_for_slot().await;

            let start = Instant::now();
            let result = self.invoke_once(payload).await;
            metrics::record_downstream_latency(start.elapsed(), result.is_ok());

            match result {
                Ok(result) => return AttemptsResult::Succeeded { result, attempts: attempt },
                Err(e) => {
                    warn!(request_id = %id, attempt, max_attempts, error = %e, "Downstream attempt failed");
                    last_error = e.to_string();
                    if attempt < max_attempts && !self.config.retry_delay.is_zero() {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        AttemptsResult::Exhausted { error: last_error, attempts: max_attempts }
    }

    /// One downstream call under the wall-clock limit; a panic counts as a failure
    async fn invoke_once(&self, payload: &Value) -> crate::Result<Value> {
        let call = AssertUnwindSafe(self.downstream.invoke(payload)).catch_unwind();
        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(EngineError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(EngineError::Timeout(self.config.call_timeout)),
        }
    }

    async fn mark_processing(&self, id: &str) {
        if let Err(e) = self.records.update_status(id, RequestStatus::Processing).await {
            warn!(request_id = %id, error = %e, "Failed to mark request processing");
        }
    }

    async fn persist_result(&self, id: &str, result: &Value, status: RequestStatus) {
        if let Err(e) = self.records.update_result(id, result, status).await {
            error!(request_id = %id, status = %status, error = %e, "Failed to persist request result");
        }
    }

    async fn release(&self, id: &str) {
        match self.backlog.decrement().await {
            Ok(depth) => debug!(request_id = %id, depth, "Backlog released"),
            Err(e) => {
                warn!(request_id = %id, error = %e, "Failed to release backlog depth");
                metrics::record_store_degraded("backlog");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
