//! Admission Scenario Tests
//!
//! End-to-end admission behaviour against the in-memory counter store:
//! - Rapid admissions at low depth stay normal and sequence 1..N
//! - The limit for the classified state is enforced per window
//! - Concurrent admitters never share a sequence number
//! - Reporting snapshots are read-only

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use sg_common::SystemState;
use sg_config::AdmissionConfig;
use sg_engine::{
    AdmissionController, AdmissionDecision, IngressService, RequestMonitor, Sequencer, StatsAggregator,
    SubmitOutcome,
};
use sg_queue::InMemoryQueue;
use sg_records::InMemoryRecordStore;
use sg_store::{CounterKeys, CounterStore, InMemoryCounterStore};

const NOW: u64 = 1_700_000_000;

struct Harness {
    admission: Arc<AdmissionController>,
    ingress: Arc<IngressService>,
    stats: StatsAggregator,
    queue: Arc<InMemoryQueue>,
}

fn harness() -> Harness {
    let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
    let keys = CounterKeys::new("scenario");
    let admission = Arc::new(AdmissionController::new(
        store.clone(),
        keys.clone(),
        &AdmissionConfig::default(),
        60,
    ));
    let monitor = Arc::new(RequestMonitor::new());
    let queue = Arc::new(InMemoryQueue::new("scenario", 30));
    let ingress = Arc::new(IngressService::new(
        admission.clone(),
        Sequencer::new(store, &keys),
        Arc::new(InMemoryRecordStore::new()),
        queue.clone(),
        monitor.clone(),
    ));
    Harness {
        stats: StatsAggregator::new(admission.clone(), monitor),
        admission,
        ingress,
        queue,
    }
}

#[tokio::test]
async fn test_fifty_rapid_admissions_at_zero_depth() {
    let h = harness();

    let mut sequences = Vec::new();
    for _ in 0..50 {
        match h.ingress.submit(json!({"prompt": "burst"})).await.unwrap() {
            SubmitOutcome::Queued { sequence_number, stats, .. } => {
                assert_eq!(stats.system_state, Some(SystemState::Normal));
                sequences.push(sequence_number);
            }
            other => panic!("expected queued, got {other:?}"),
        }
    }

    assert_eq!(sequences, (1..=50).collect::<Vec<i64>>());
    assert_eq!(h.queue.len(), 50);
    assert_eq!(h.admission.backlog().read().await.unwrap(), 50);
}

#[tokio::test]
async fn test_overloaded_rejects_81st_in_window() {
    let h = harness();
    h.admission.backlog().reset_to(750).await.unwrap();

    for _ in 0..80 {
        let decision = h.admission.try_admit_at(NOW).await;
        assert!(decision.is_accepted());
        assert_eq!(decision.stats().system_state, Some(SystemState::Overloaded));
        assert_eq!(decision.stats().input_limit, Some(80));
    }

    match h.admission.try_admit_at(NOW).await {
        AdmissionDecision::Rejected { reason, .. } => assert!(reason.contains("81/80"), "reason was {reason}"),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(h.admission.backlog().read().await.unwrap(), 830);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admissions_respect_window_limit() {
    let h = harness();
    // Busy: 200 per window
    h.admission.backlog().reset_to(200).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..400 {
        let admission = h.admission.clone();
        handles.push(tokio::spawn(async move { admission.try_admit_at(NOW).await.is_accepted() }));
    }

    let mut accepted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 200);
    assert_eq!(h.admission.backlog().read().await.unwrap(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_get_unique_sequences() {
    let h = harness();

    let mut handles = Vec::new();
    for i in 0..200 {
        let ingress = h.ingress.clone();
        handles.push(tokio::spawn(async move { ingress.submit(json!({"n": i})).await }));
    }

    let mut sequences = HashSet::new();
    let mut accepted = 0;
    for handle in handles {
        if let SubmitOutcome::Queued { sequence_number, .. } = handle.await.unwrap().unwrap() {
            accepted += 1;
            assert!(sequences.insert(sequence_number), "duplicate sequence {sequence_number}");
        }
    }
    assert_eq!(sequences.len(), accepted);
}

#[tokio::test]
async fn test_snapshot_is_idempotent() {
    let h = harness();
    h.admission.backlog().reset_to(640).await.unwrap();

    let first = h.stats.snapshot().await;
    let second = h.stats.snapshot().await;

    assert_eq!(first.adaptive, second.adaptive);
    assert_eq!(first.adaptive.queue_size, 640);
    assert_eq!(first.adaptive.system_state, Some(SystemState::Overloaded));
    assert_eq!(first.monitor.total_requests, second.monitor.total_requests);
    assert_eq!(h.admission.backlog().read().await.unwrap(), 640);
}
