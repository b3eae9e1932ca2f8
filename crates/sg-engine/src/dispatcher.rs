//! Dispatcher loop
//!
//! Polls the queue in batches and runs each job on its own task, bounded by a
//! semaphore of `max_in_flight` permits. While a job runs its visibility is
//! extended periodically so the broker does not redeliver it to another
//! worker. Jobs are acked once the worker reports any outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use sg_common::QueuedJob;
use sg_config::{DispatchConfig, QueueConfig};
use sg_queue::{QueueConsumer, QueueError};

use crate::worker::DispatchWorker;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_batch: u32,
    pub idle_poll: Duration,
    pub max_in_flight: usize,
    pub visibility_timeout_secs: u32,
}

impl DispatcherConfig {
    pub fn from_config(dispatch: &DispatchConfig, queue: &QueueConfig) -> Self {
        Self {
            poll_batch: dispatch.poll_batch.max(1),
            idle_poll: Duration::from_millis(dispatch.idle_poll_ms),
            max_in_flight: dispatch.max_in_flight.max(1),
            visibility_timeout_secs: queue.visibility_timeout_secs.max(2),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default(), &QueueConfig::default())
    }
}

pub struct Dispatcher {
    consumer: Arc<dyn QueueConsumer>,
    worker: Arc<DispatchWorker>,
    semaphore: Arc<Semaphore>,
    config: DispatcherConfig,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Dispatcher {
    pub fn new(consumer: Arc<dyn QueueConsumer>, worker: Arc<DispatchWorker>, config: DispatcherConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            consumer,
            worker,
            semaphore: Arc::new(Semaphore::new(config.max_in_flight)),
            config,
            shutdown_tx,
            running: AtomicBool::new(true),
        }
    }

    /// Jobs currently being processed
    pub fn in_flight(&self) -> usize {
        self.config.max_in_flight - self.semaphore.available_permits()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Poll and dispatch until `shutdown` is called
    pub async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(
            queue = %self.consumer.identifier(),
            max_in_flight = self.config.max_in_flight,
            "Dispatcher started"
        );

        while self.is_running() {
            // Wait for capacity before polling so polled jobs never sit unprocessed
            let available = self.semaphore.available_permits();
            if available == 0 {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    permit = self.semaphore.clone().acquire_owned() => {
                        drop(permit);
                        continue;
                    }
                }
            }

            let max_jobs = self.config.poll_batch.min(available as u32);
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = self.consumer.poll(max_jobs) => {
                    match result {
                        Ok(jobs) if !jobs.is_empty() => {
                            debug!(count = jobs.len(), "Polled jobs");
                            for job in jobs {
                                let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                                    warn!("Dispatcher semaphore closed");
                                    return;
                                };
                                self.spawn_job(job, permit);
                            }
                        }
                        Ok(_) => tokio::time::sleep(self.config.idle_poll).await,
                        Err(QueueError::Stopped) => break,
                        Err(e) => {
                            error!(error = %e, queue = %self.consumer.identifier(), "Error polling");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        info!(queue = %self.consumer.identifier(), "Dispatcher loop stopped");
    }

    fn spawn_job(&self, job: QueuedJob, permit: OwnedSemaphorePermit) {
        let consumer = self.consumer.clone();
        let worker = self.worker.clone();
        let visibility_secs = self.config.visibility_timeout_secs;

        tokio::spawn(async move {
            let process = worker.process(&job);
            tokio::pin!(process);

            let mut heartbeat = tokio::time::interval(Duration::from_secs((visibility_secs / 2) as u64));
            // The first tick completes immediately
            heartbeat.tick().await;

            let outcome = loop {
                tokio::select! {
                    outcome = &mut process => break outcome,
                    _ = heartbeat.tick() => {
                        if let Err(e) = consumer.extend_visibility(&job.receipt_handle, visibility_secs).await {
                            warn!(request_id = %job.job.request_id, error = %e, "Failed to extend visibility");
                        }
                    }
                }
            };

            debug!(request_id = %job.job.request_id, outcome = outcome.label(), "Job finished");
            if let Err(e) = consumer.ack(&job.receipt_handle).await {
                warn!(request_id = %job.job.request_id, error = %e, "Failed to ack job");
            }
            drop(permit);
        });
    }

    /// Stop polling and wait up to `drain_timeout` for in-flight jobs.
    ///
    /// Returns whether every in-flight job finished in time. Jobs still running
    /// are redelivered by the broker after their visibility timeout.
    pub async fn shutdown(&self, drain_timeout: Duration) -> bool {
        info!("Dispatcher shutting down...");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        self.consumer.stop().await;

        let permits = self.config.max_in_flight as u32;
        match tokio::time::timeout(drain_timeout, self.semaphore.acquire_many(permits)).await {
            Ok(Ok(_)) => {
                info!("Dispatcher drained");
                true
            }
            Ok(Err(_)) => false,
            Err(_) => {
                warn!(remaining = self.in_flight(), "Drain timed out with jobs still in flight");
                false
            }
        }
    }
}
