//! Ingress pipeline
//!
//! One inbound request goes through: monitor count, admission, sequencing,
//! record creation, queue publish. Record creation is best-effort. A failed
//! publish releases the depth admission took, since no worker will ever
//! decrement it.

use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use sg_common::{AdmissionStats, DispatchJob};
use sg_queue::QueuePublisher;
use sg_records::{RecordError, RecordStore};

use crate::admission::{round1, AdmissionController, AdmissionDecision};
use crate::error::EngineError;
use crate::sequencer::{Sequence, Sequencer};
use crate::stats::RequestMonitor;
use crate::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Queued {
        request_id: String,
        sequence_number: i64,
        /// The sequence number came from the local clock fallback
        sequence_degraded: bool,
        estimated_wait_minutes: f64,
        stats: AdmissionStats,
    },
    Rejected {
        reason: String,
        stats: AdmissionStats,
    },
}

pub struct IngressService {
    admission: Arc<AdmissionController>,
    sequencer: Sequencer,
    records: Arc<dyn RecordStore>,
    publisher: Arc<dyn QueuePublisher>,
    monitor: Arc<RequestMonitor>,
}

impl IngressService {
    pub fn new(
        admission: Arc<AdmissionController>,
        sequencer: Sequencer,
        records: Arc<dyn RecordStore>,
        publisher: Arc<dyn QueuePublisher>,
        monitor: Arc<RequestMonitor>,
    ) -> Self {
        Self {
            admission,
            sequencer,
            records,
            publisher,
            monitor,
        }
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn monitor(&self) -> &Arc<RequestMonitor> {
        &self.monitor
    }

    /// Admit and enqueue one payload.
    ///
    /// Rejection is an `Ok` outcome. Only a failed queue publish is an error.
    pub async fn submit(&self, payload: Value) -> Result<SubmitOutcome> {
        self.monitor.record_request();

        let stats = match self.admission.try_admit().await {
            AdmissionDecision::Accepted { stats } => stats,
            AdmissionDecision::Rejected { reason, stats } => {
                self.monitor.record_rate_limited();
                return Ok(SubmitOutcome::Rejected { reason, stats });
            }
        };

        let request_id = Uuid::new_v4().to_string();
        let sequence = self.sequencer.next().await;
        let sequence = self.create_record(&request_id, &payload, sequence).await;

        let job = DispatchJob {
            request_id: request_id.clone(),
            payload,
            sequence_number: sequence.value,
        };
        if let Err(e) = self.publisher.publish(job).await {
            error!(request_id = %request_id, error = %e, "Failed to enqueue admitted request");
            if let Err(release) = self.admission.backlog().decrement().await {
                warn!(request_id = %request_id, error = %release, "Failed to release backlog depth after publish failure");
            }
            return Err(EngineError::Queue(e));
        }

        let depth = stats.queue_size.unwrap_or(0) + 1;
        let estimated_wait_minutes = round1(depth as f64 / self.admission.output_rps() as f64 / 60.0);

        info!(
            request_id = %request_id,
            sequence = sequence.value,
            degraded = stats.is_degraded() || sequence.degraded,
            "Request queued"
        );

        Ok(SubmitOutcome::Queued {
            request_id,
            sequence_number: sequence.value,
            sequence_degraded: sequence.degraded,
            estimated_wait_minutes,
            stats,
        })
    }

    /// Persist the pending record, best-effort.
    ///
    /// A sequence collision means the shared counter is behind the stored
    /// records. The counter is raised past them and one fresh number drawn.
    async fn create_record(&self, request_id: &str, payload: &Value, sequence: Sequence) -> Sequence {
        let taken = match self.records.create(request_id, payload, sequence.value).await {
            Ok(_) => return sequence,
            Err(RecordError::DuplicateSequence(taken)) => taken,
            Err(e) => {
                warn!(request_id = %request_id, sequence = sequence.value, error = %e, "Failed to create request record");
                return sequence;
            }
        };

        warn!(request_id = %request_id, sequence = taken, "Sequence number already recorded, resyncing sequencer");
        if let Err(e) = self.sequencer.resume_after(self.records.as_ref()).await {
            warn!(error = %e, "Failed to resync sequencer from stored records");
        }

        let retry = self.sequencer.next().await;
        if let Err(e) = self.records.create(request_id, payload, retry.value).await {
            warn!(request_id = %request_id, sequence = retry.value, error = %e, "Failed to create request record");
        }
        retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use sg_common::RequestStatus;
    use sg_config::AdmissionConfig;
    use sg_queue::{InMemoryQueue, QueueConsumer, QueueError};
    use sg_records::InMemoryRecordStore;
    use sg_store::{CounterKeys, CounterStore, InMemoryCounterStore, UnreachableCounterStore};

    struct ClosedPublisher;

    #[async_trait]
    impl QueuePublisher for ClosedPublisher {
        fn identifier(&self) -> &str {
            "closed"
        }

        async fn publish(&self, _job: DispatchJob) -> sg_queue::Result<String> {
            Err(QueueError::Stopped)
        }
    }

    fn service(
        store: Arc<dyn CounterStore>,
        records: Arc<InMemoryRecordStore>,
        publisher: Arc<dyn QueuePublisher>,
    ) -> IngressService {
        let keys = CounterKeys::new("t");
        let admission = AdmissionController::new(store.clone(), keys.clone(), &AdmissionConfig::default(), 60);
        IngressService::new(
            Arc::new(admission),
            Sequencer::new(store, &keys),
            records,
            publisher,
            Arc::new(RequestMonitor::new()),
        )
    }

    #[tokio::test]
    async fn test_submit_queues_and_records() {
        let records = Arc::new(InMemoryRecordStore::new());
        let queue = Arc::new(InMemoryQueue::new("q", 30));
        let svc = service(Arc::new(InMemoryCounterStore::new()), records.clone(), queue.clone());

        let (request_id, sequence_number, sequence_degraded) = match svc.submit(json!({"prompt": "hi"})).await.unwrap() {
            SubmitOutcome::Queued { request_id, sequence_number, sequence_degraded, .. } => {
                (request_id, sequence_number, sequence_degraded)
            }
            other => panic!("expected queued, got {other:?}"),
        };
        assert_eq!(sequence_number, 1);
        assert!(!sequence_degraded);

        let record = records.get(&request_id).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Pending);
        assert_eq!(record.sequence_number, 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(svc.monitor().snapshot().total_requests, 1);
    }

    #[tokio::test]
    async fn test_publish_failure_releases_depth() {
        let svc = service(
            Arc::new(InMemoryCounterStore::new()),
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(ClosedPublisher),
        );

        let result = svc.submit(json!({})).await;
        assert!(matches!(result, Err(EngineError::Queue(QueueError::Stopped))));
        assert_eq!(svc.admission().backlog().read().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_record_failure_does_not_block_enqueue() {
        let records = Arc::new(InMemoryRecordStore::new());
        records.set_fail_writes(true);
        let queue = Arc::new(InMemoryQueue::new("q", 30));
        let svc = service(Arc::new(InMemoryCounterStore::new()), records, queue.clone());

        assert!(matches!(svc.submit(json!({})).await.unwrap(), SubmitOutcome::Queued { .. }));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_counter_resyncs_instead_of_losing_record() {
        // Durable records outlive the counter store, e.g. a restart on the memory backend
        let records = Arc::new(InMemoryRecordStore::new());
        let queue = Arc::new(InMemoryQueue::new("q", 30));
        let before = service(Arc::new(InMemoryCounterStore::new()), records.clone(), queue.clone());
        let after = service(Arc::new(InMemoryCounterStore::new()), records.clone(), queue.clone());

        assert!(matches!(before.submit(json!({"n": 1})).await.unwrap(), SubmitOutcome::Queued { sequence_number: 1, .. }));

        let (request_id, sequence_number) = match after.submit(json!({"n": 2})).await.unwrap() {
            SubmitOutcome::Queued { request_id, sequence_number, .. } => (request_id, sequence_number),
            other => panic!("expected queued, got {other:?}"),
        };
        assert_eq!(sequence_number, 2);

        let record = records.get(&request_id).await.unwrap().unwrap();
        assert_eq!(record.sequence_number, 2);
        assert_eq!(records.len(), 2);

        // The queued job carries the sequence that was actually recorded
        let jobs = queue.poll(10).await.unwrap();
        let job = jobs.iter().find(|j| j.job.request_id == request_id).unwrap();
        assert_eq!(job.job.sequence_number, 2);
    }

    #[tokio::test]
    async fn test_store_outage_admits_with_degraded_sequence() {
        let queue = Arc::new(InMemoryQueue::new("q", 30));
        let svc = service(
            Arc::new(UnreachableCounterStore::new("down")),
            Arc::new(InMemoryRecordStore::new()),
            queue.clone(),
        );

        match svc.submit(json!({})).await.unwrap() {
            SubmitOutcome::Queued { sequence_degraded, stats, .. } => {
                assert!(sequence_degraded);
                assert!(stats.is_degraded());
            }
            other => panic!("expected queued, got {other:?}"),
        }
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_counts_as_rate_limited() {
        let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
        let mut config = AdmissionConfig::default();
        config.normal_rps = 2;
        let keys = CounterKeys::new("t");
        let svc = IngressService::new(
            Arc::new(AdmissionController::new(store.clone(), keys.clone(), &config, 60)),
            Sequencer::new(store, &keys),
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(InMemoryQueue::new("q", 30)),
            Arc::new(RequestMonitor::new()),
        );

        let mut rejected = 0;
        for _ in 0..5 {
            if let SubmitOutcome::Rejected { reason, .. } = svc.submit(json!({})).await.unwrap() {
                assert!(reason.starts_with("Input rate limit exceeded"));
                rejected += 1;
            }
        }
        // A window rollover mid-loop can let up to four through
        assert!(rejected >= 1);
        let snapshot = svc.monitor().snapshot();
        assert_eq!(snapshot.total_requests, 5);
        assert_eq!(snapshot.rate_limited_requests, rejected);
    }
}
