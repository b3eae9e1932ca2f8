//! In-process queue with the same visibility semantics as the SQLite queue

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use sg_common::{DispatchJob, QueuedJob};
use crate::{EmbeddedQueue, QueueConsumer, QueueError, QueueMetrics, QueuePublisher, Result};

struct StoredJob {
    job: DispatchJob,
    receipt_handle: Option<String>,
    visible_at: Instant,
    receive_count: u32,
}

pub struct InMemoryQueue {
    name: String,
    visibility_timeout: Duration,
    jobs: Mutex<Vec<StoredJob>>,
    running: AtomicBool,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>, visibility_timeout_seconds: u32) -> Self {
        Self {
            name: name.into(),
            visibility_timeout: Duration::from_secs(visibility_timeout_seconds as u64),
            jobs: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        }
    }

    /// Jobs still held by the queue, visible or in flight
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

}

#[async_trait]
impl QueueConsumer for InMemoryQueue {
    fn identifier(&self) -> &str {
        &self.name
    }

    async fn poll(&self, max_jobs: u32) -> Result<Vec<QueuedJob>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let now = Instant::now();
        let mut jobs = self.jobs.lock();
        jobs.sort_by_key(|s| s.job.sequence_number);

        let mut polled = Vec::new();
        for stored in jobs.iter_mut() {
            if polled.len() >= max_jobs as usize {
                break;
            }
            if stored.visible_at > now {
                continue;
            }

            let receipt_handle = uuid::Uuid::new_v4().to_string();
            stored.receipt_handle = Some(receipt_handle.clone());
            stored.visible_at = now + self.visibility_timeout;
            stored.receive_count += 1;

            polled.push(QueuedJob {
                job: stored.job.clone(),
                receipt_handle,
                receive_count: stored.receive_count,
                queue_identifier: self.name.clone(),
            });
        }

        if !polled.is_empty() {
            debug!(queue = %self.name, count = polled.len(), "Polled jobs from memory queue");
        }
        Ok(polled)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|s| s.receipt_handle.as_deref() != Some(receipt_handle));
        if jobs.len() == before {
            return Err(QueueError::UnknownReceipt(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let stored = jobs
            .iter_mut()
            .find(|s| s.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| QueueError::UnknownReceipt(receipt_handle.to_string()))?;
        stored.visible_at = Instant::now() + Duration::from_secs(seconds as u64);
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.name, "Memory queue consumer stopped");
    }

    async fn get_metrics(&self) -> Result<QueueMetrics> {
        let now = Instant::now();
        let jobs = self.jobs.lock();
        let in_flight = jobs
            .iter()
            .filter(|s| s.receipt_handle.is_some() && s.visible_at > now)
            .count() as u64;

        Ok(QueueMetrics {
            pending_jobs: jobs.len() as u64 - in_flight,
            in_flight_jobs: in_flight,
            queue_identifier: self.name.clone(),
        })
    }
}

#[async_trait]
impl QueuePublisher for InMemoryQueue {
    fn identifier(&self) -> &str {
        &self.name
    }

    async fn publish(&self, job: DispatchJob) -> Result<String> {
        let id = job.request_id.clone();
        let mut jobs = self.jobs.lock();
        if jobs.iter().any(|s| s.job.request_id == id) {
            debug!(request_id = %id, queue = %self.name, "Duplicate job detected, skipping");
            return Ok(id);
        }
        jobs.push(StoredJob {
            job,
            receipt_handle: None,
            visible_at: Instant::now(),
            receive_count: 0,
        });
        Ok(id)
    }
}

#[async_trait]
impl EmbeddedQueue for InMemoryQueue {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(id: &str, seq: i64) -> DispatchJob {
        DispatchJob {
            request_id: id.to_string(),
            payload: json!({"prompt": id}),
            sequence_number: seq,
        }
    }

    #[tokio::test]
    async fn test_publish_poll_ack() {
        let queue = InMemoryQueue::new("test", 30);
        queue.publish(job("b", 2)).await.unwrap();
        queue.publish(job("a", 1)).await.unwrap();

        let polled = queue.poll(10).await.unwrap();
        assert_eq!(polled.len(), 2);
        assert_eq!(polled[0].job.request_id, "a");
        assert_eq!(polled[0].receive_count, 1);

        for queued in &polled {
            queue.ack(&queued.receipt_handle).await.unwrap();
        }
        assert!(queue.is_empty());
        assert!(matches!(
            queue.ack(&polled[0].receipt_handle).await,
            Err(QueueError::UnknownReceipt(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_publish_is_ignored() {
        let queue = InMemoryQueue::new("test", 30);
        queue.publish(job("a", 1)).await.unwrap();
        queue.publish(job("a", 1)).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_job_is_redelivered_after_timeout() {
        let queue = InMemoryQueue::new("test", 5);
        queue.publish(job("a", 1)).await.unwrap();

        let first = queue.poll(1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(queue.poll(1).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        let second = queue.poll(1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].receive_count, 2);
        assert_ne!(second[0].receipt_handle, first[0].receipt_handle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_visibility_and_metrics() {
        let queue = InMemoryQueue::new("test", 5);
        queue.publish(job("a", 1)).await.unwrap();
        queue.publish(job("b", 2)).await.unwrap();

        let polled = queue.poll(1).await.unwrap();
        assert_eq!(
            queue.get_metrics().await.unwrap(),
            QueueMetrics {
                pending_jobs: 1,
                in_flight_jobs: 1,
                queue_identifier: "test".to_string(),
            }
        );

        tokio::time::advance(Duration::from_secs(4)).await;
        queue.extend_visibility(&polled[0].receipt_handle, 10).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;

        // Still hidden past the original 5s timeout
        let next = queue.poll(10).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].job.request_id, "b");
        assert_eq!(queue.get_metrics().await.unwrap().in_flight_jobs, 2);
    }

    #[tokio::test]
    async fn test_stopped_queue_rejects_poll() {
        let queue = InMemoryQueue::new("test", 30);
        queue.stop().await;
        assert!(matches!(queue.poll(1).await, Err(QueueError::Stopped)));
    }
}
