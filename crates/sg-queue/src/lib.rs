use async_trait::async_trait;
use sg_common::{DispatchJob, QueuedJob};

pub mod error;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use error::QueueError;
pub use memory::InMemoryQueue;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Queue depth for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    /// Jobs waiting for a worker, including ones due for redelivery
    pub pending_jobs: u64,
    /// Jobs handed to a worker and not yet acked
    pub in_flight_jobs: u64,
    pub queue_identifier: String,
}

/// Trait for consuming dispatch jobs from a queue.
///
/// Delivery is at-least-once: a job that is polled and not acked becomes
/// visible again once its visibility timeout lapses.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Get the unique identifier for this consumer
    fn identifier(&self) -> &str;

    /// Poll for visible jobs, oldest sequence first
    async fn poll(&self, max_jobs: u32) -> Result<Vec<QueuedJob>>;

    /// Acknowledge a job (remove from queue)
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Push back the visibility deadline of an in-flight job
    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()>;

    /// Stop the consumer; later polls fail with `QueueError::Stopped`
    async fn stop(&self);

    async fn get_metrics(&self) -> Result<QueueMetrics>;
}

/// Trait for publishing dispatch jobs to a queue
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    fn identifier(&self) -> &str;

    /// Publish a job, returning its request id.
    ///
    /// Publishing the same request id twice is a no-op.
    async fn publish(&self, job: DispatchJob) -> Result<String>;
}

/// Combined consumer and publisher for single-node deployments
#[async_trait]
pub trait EmbeddedQueue: QueueConsumer + QueuePublisher {
    /// Initialize the queue schema (create tables, etc.)
    async fn init_schema(&self) -> Result<()>;
}
