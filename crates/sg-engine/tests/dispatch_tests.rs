//! Dispatch Pipeline Tests
//!
//! Admission through queue, dispatcher and worker to a terminal record:
//! - Retries end in the third attempt's result with one depth release
//! - Concurrent workers are paced globally
//! - Backlog depth returns to its starting point after a burst

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use sg_common::RequestStatus;
use sg_config::{AdmissionConfig, HousekeepingConfig};
use sg_engine::{
    AdmissionController, Dispatcher, DispatcherConfig, DispatchWorker, Downstream, EngineError, Housekeeper,
    IngressService, OutputPacer, RequestMonitor, Sequencer, SubmitOutcome, WorkerConfig,
};
use sg_queue::InMemoryQueue;
use sg_records::{InMemoryRecordStore, RecordStore};
use sg_store::{CounterKeys, CounterStore, InMemoryCounterStore};

/// Fails the first `failures` calls, then answers with the attempt number
struct FlakyDownstream {
    failures: u32,
    calls: AtomicU32,
    call_times: parking_lot::Mutex<Vec<Instant>>,
}

impl FlakyDownstream {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
            call_times: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Downstream for FlakyDownstream {
    async fn invoke(&self, _payload: &Value) -> sg_engine::Result<Value> {
        self.call_times.lock().push(Instant::now());
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(30)).await;
        if attempt <= self.failures {
            return Err(EngineError::Downstream(format!("attempt {attempt} failed")));
        }
        Ok(json!({ "attempt": attempt }))
    }
}

struct Pipeline {
    admission: Arc<AdmissionController>,
    ingress: IngressService,
    records: Arc<InMemoryRecordStore>,
    queue: Arc<InMemoryQueue>,
    dispatcher: Arc<Dispatcher>,
}

fn pipeline(downstream: Arc<dyn Downstream>, output_rps: u32, max_in_flight: usize) -> Pipeline {
    let store: Arc<dyn CounterStore> = Arc::new(InMemoryCounterStore::new());
    let keys = CounterKeys::new("pipeline");
    let records = Arc::new(InMemoryRecordStore::new());
    let queue = Arc::new(InMemoryQueue::new("pipeline", 30));
    let admission = Arc::new(AdmissionController::new(
        store.clone(),
        keys.clone(),
        &AdmissionConfig::default(),
        output_rps,
    ));

    let ingress = IngressService::new(
        admission.clone(),
        Sequencer::new(store.clone(), &keys),
        records.clone(),
        queue.clone(),
        Arc::new(RequestMonitor::new()),
    );

    let worker = DispatchWorker::new(
        records.clone(),
        downstream,
        OutputPacer::new(store.clone(), &keys, output_rps),
        admission.backlog().clone(),
        Housekeeper::new(store, keys, HousekeepingConfig::default()),
        WorkerConfig {
            max_attempts: 3,
            call_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(100),
            max_deliveries: 3,
        },
    );
    let dispatcher = Arc::new(Dispatcher::new(
        queue.clone(),
        Arc::new(worker),
        DispatcherConfig {
            poll_batch: 10,
            idle_poll: Duration::from_millis(10),
            max_in_flight,
            visibility_timeout_secs: 30,
        },
    ));

    Pipeline {
        admission,
        ingress,
        records,
        queue,
        dispatcher,
    }
}

async fn submit(p: &Pipeline) -> String {
    match p.ingress.submit(json!({"prompt": "work"})).await.unwrap() {
        SubmitOutcome::Queued { request_id, .. } => request_id,
        other => panic!("expected queued, got {other:?}"),
    }
}

async fn wait_until_drained(queue: &InMemoryQueue) {
    for _ in 0..2000 {
        if queue.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue never drained");
}

#[tokio::test(start_paused = true)]
async fn test_two_failures_then_success_completes_once() {
    let downstream = Arc::new(FlakyDownstream::new(2));
    let p = pipeline(downstream.clone(), 60, 4);
    p.admission.backlog().reset_to(5).await.unwrap();

    let id = submit(&p).await;
    assert_eq!(p.admission.backlog().read().await.unwrap(), 6);

    let handle = tokio::spawn(p.dispatcher.clone().run());
    wait_until_drained(&p.queue).await;

    let record = p.records.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status, RequestStatus::Completed);
    assert_eq!(record.result, Some(json!({"attempt": 3})));
    assert!(record.completed_at.is_some());

    assert_eq!(downstream.calls.load(Ordering::SeqCst), 3);
    assert_eq!(p.admission.backlog().read().await.unwrap(), 5);

    p.dispatcher.shutdown(Duration::from_secs(5)).await;
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_workers_are_paced_globally() {
    let downstream = Arc::new(FlakyDownstream::new(0));
    // 20 per second: at least 50ms between dispatches
    let p = pipeline(downstream.clone(), 20, 8);

    for _ in 0..12 {
        submit(&p).await;
    }

    let handle = tokio::spawn(p.dispatcher.clone().run());
    wait_until_drained(&p.queue).await;

    let mut times = downstream.call_times.lock().clone();
    assert_eq!(times.len(), 12);
    times.sort();
    for pair in times.windows(2) {
        assert!(
            pair[1] - pair[0] >= Duration::from_millis(50),
            "dispatches {:?} apart",
            pair[1] - pair[0]
        );
    }

    p.dispatcher.shutdown(Duration::from_secs(5)).await;
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_burst_returns_depth_to_zero() {
    let downstream = Arc::new(FlakyDownstream::new(0));
    let p = pipeline(downstream, 60, 16);

    let mut ids = Vec::new();
    for _ in 0..30 {
        ids.push(submit(&p).await);
    }
    assert_eq!(p.admission.backlog().read().await.unwrap(), 30);

    let handle = tokio::spawn(p.dispatcher.clone().run());
    wait_until_drained(&p.queue).await;

    for id in &ids {
        assert_eq!(p.records.get(id).await.unwrap().unwrap().status, RequestStatus::Completed);
    }
    assert_eq!(p.admission.backlog().read().await.unwrap(), 0);

    p.dispatcher.shutdown(Duration::from_secs(5)).await;
    handle.await.unwrap();
}
