use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use sg_common::{DispatchJob, QueuedJob};
use crate::{EmbeddedQueue, QueueConsumer, QueueError, QueueMetrics, QueuePublisher, Result};

/// SQLite-backed dispatch queue with SQS-style visibility timeouts.
///
/// Timestamps are stored in unix milliseconds.
pub struct SqliteQueue {
    pool: Pool<Sqlite>,
    queue_name: String,
    visibility_timeout_seconds: u32,
    running: AtomicBool,
}

impl SqliteQueue {
    pub fn new(pool: Pool<Sqlite>, queue_name: String, visibility_timeout_seconds: u32) -> Self {
        Self {
            pool,
            queue_name,
            visibility_timeout_seconds,
            running: AtomicBool::new(true),
        }
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dispatch_queue (
                request_id TEXT NOT NULL,
                queue_name TEXT NOT NULL,
                sequence_number INTEGER NOT NULL,
                receipt_handle TEXT,
                visible_at INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                receive_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (queue_name, request_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_dispatch_queue_visible
            ON dispatch_queue (queue_name, visible_at, sequence_number)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_dispatch_queue_receipt
            ON dispatch_queue (receipt_handle)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(queue = %self.queue_name, "SQLite dispatch queue schema initialized");
        Ok(())
    }
}

#[async_trait]
impl QueueConsumer for SqliteQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn poll(&self, max_jobs: u32) -> Result<Vec<QueuedJob>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let now = Utc::now().timestamp_millis();
        let new_visible_at = now + self.visibility_timeout_seconds as i64 * 1000;

        let rows = sqlx::query(
            r#"
            SELECT request_id, payload
            FROM dispatch_queue
            WHERE queue_name = ? AND visible_at <= ?
            ORDER BY sequence_number
            LIMIT ?
            "#,
        )
        .bind(&self.queue_name)
        .bind(now)
        .bind(max_jobs as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());

        for row in rows {
            let request_id: String = row.get("request_id");
            let payload: String = row.get("payload");
            let receipt_handle = uuid::Uuid::new_v4().to_string();

            // The visible_at guard makes the claim atomic between competing consumers
            let claimed = sqlx::query(
                r#"
                UPDATE dispatch_queue
                SET receipt_handle = ?, visible_at = ?, receive_count = receive_count + 1
                WHERE request_id = ? AND queue_name = ? AND visible_at <= ?
                RETURNING receive_count
                "#,
            )
            .bind(&receipt_handle)
            .bind(new_visible_at)
            .bind(&request_id)
            .bind(&self.queue_name)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            let Some(claimed) = claimed else {
                continue;
            };
            let receive_count: i64 = claimed.get("receive_count");

            let job: DispatchJob = serde_json::from_str(&payload)?;
            jobs.push(QueuedJob {
                job,
                receipt_handle,
                receive_count: receive_count as u32,
                queue_identifier: self.queue_name.clone(),
            });
        }

        if !jobs.is_empty() {
            debug!(queue = %self.queue_name, count = jobs.len(), "Polled jobs from SQLite queue");
        }

        Ok(jobs)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM dispatch_queue WHERE receipt_handle = ? AND queue_name = ?",
        )
        .bind(receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                receipt_handle = %receipt_handle,
                queue = %self.queue_name,
                "ACK failed - job not found or already deleted"
            );
            return Err(QueueError::UnknownReceipt(receipt_handle.to_string()));
        }

        debug!(receipt_handle = %receipt_handle, queue = %self.queue_name, "Job acknowledged");
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        let new_visible_at = Utc::now().timestamp_millis() + seconds as i64 * 1000;

        let result = sqlx::query(
            "UPDATE dispatch_queue SET visible_at = ? WHERE receipt_handle = ? AND queue_name = ?",
        )
        .bind(new_visible_at)
        .bind(receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownReceipt(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "SQLite queue consumer stopped");
    }

    async fn get_metrics(&self) -> Result<QueueMetrics> {
        let now = Utc::now().timestamp_millis();

        let row = sqlx::query(
            r#"
            SELECT
                SUM(CASE WHEN receipt_handle IS NOT NULL AND visible_at > ? THEN 1 ELSE 0 END) AS in_flight,
                COUNT(*) AS total
            FROM dispatch_queue
            WHERE queue_name = ?
            "#,
        )
        .bind(now)
        .bind(&self.queue_name)
        .fetch_one(&self.pool)
        .await?;

        let in_flight: Option<i64> = row.get("in_flight");
        let total: i64 = row.get("total");
        let in_flight = in_flight.unwrap_or(0);

        Ok(QueueMetrics {
            pending_jobs: (total - in_flight).max(0) as u64,
            in_flight_jobs: in_flight as u64,
            queue_identifier: self.queue_name.clone(),
        })
    }
}

#[async_trait]
impl QueuePublisher for SqliteQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn publish(&self, job: DispatchJob) -> Result<String> {
        let now = Utc::now().timestamp_millis();
        let payload = serde_json::to_string(&job)?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO dispatch_queue
                (request_id, queue_name, sequence_number, visible_at, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.request_id)
        .bind(&self.queue_name)
        .bind(job.sequence_number)
        .bind(now)
        .bind(&payload)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            debug!(request_id = %job.request_id, queue = %self.queue_name, "Duplicate job detected, skipping");
        } else {
            debug!(
                request_id = %job.request_id,
                sequence = job.sequence_number,
                queue = %self.queue_name,
                "Job published to SQLite queue"
            );
        }

        Ok(job.request_id)
    }
}

#[async_trait]
impl EmbeddedQueue for SqliteQueue {
    async fn init_schema(&self) -> Result<()> {
        self.create_schema().await
    }
}
