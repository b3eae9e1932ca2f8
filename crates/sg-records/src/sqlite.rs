//! SQLite Record Store
//!
//! Timestamps are unix milliseconds. Status transitions are guarded in the
//! `UPDATE ... WHERE status IN (...)` clause so concurrent writers cannot move
//! a record backwards.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use sg_common::{RequestRecord, RequestStatus};
use crate::{predecessors, RecordError, RecordStore, Result};

pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the requests table and its indexes
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS requests (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                result TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                sequence_number INTEGER NOT NULL UNIQUE,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                completed_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_requests_status ON requests (status)",
            "CREATE INDEX IF NOT EXISTS idx_requests_created_at ON requests (created_at)",
            "CREATE INDEX IF NOT EXISTS idx_requests_sequence ON requests (sequence_number)",
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }

        info!("SQLite record store schema initialized");
        Ok(())
    }

    fn build_in_clause(count: usize) -> String {
        vec!["?"; count].join(", ")
    }

    fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<RequestRecord> {
        let id: String = row.get("id");
        let corrupt = |reason: String| RecordError::Corrupt { id: id.clone(), reason };

        let timestamp = |column: &str| -> Result<DateTime<Utc>> {
            let millis: i64 = row.get(column);
            DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| corrupt(format!("invalid {column} timestamp {millis}")))
        };

        let status: String = row.get("status");
        let status = status.parse::<RequestStatus>().map_err(|e| corrupt(e.to_string()))?;

        let payload: String = row.get("payload");
        let result: Option<String> = row.get("result");
        let completed_at: Option<i64> = row.get("completed_at");

        Ok(RequestRecord {
            id: id.clone(),
            payload: serde_json::from_str(&payload)?,
            sequence_number: row.get("sequence_number"),
            status,
            result: result.as_deref().map(serde_json::from_str).transpose()?,
            created_at: timestamp("created_at")?,
            updated_at: timestamp("updated_at")?,
            completed_at: completed_at.and_then(DateTime::from_timestamp_millis),
        })
    }

    /// Apply a guarded transition, explaining why when no row moved
    async fn transition(
        &self,
        id: &str,
        status: RequestStatus,
        result: Option<&serde_json::Value>,
    ) -> Result<()> {
        let allowed = predecessors(status);
        let now = Utc::now().timestamp_millis();
        let completed_at = status.is_terminal().then_some(now);
        let result = result.map(serde_json::to_string).transpose()?;

        let query = format!(
            "UPDATE requests SET status = ?, updated_at = ?, \
             completed_at = COALESCE(?, completed_at), result = COALESCE(?, result) \
             WHERE id = ? AND status IN ({})",
            Self::build_in_clause(allowed.len())
        );

        let mut q = sqlx::query(&query)
            .bind(status.as_str())
            .bind(now)
            .bind(completed_at)
            .bind(result)
            .bind(id);
        for from in &allowed {
            q = q.bind(from.as_str());
        }
        let updated = q.execute(&self.pool).await?;

        if updated.rows_affected() == 1 {
            debug!(request_id = %id, status = %status, "Record status updated");
            return Ok(());
        }

        match self.get(id).await? {
            None => Err(RecordError::NotFound(id.to_string())),
            Some(current) => Err(RecordError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to: status,
            }),
        }
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn create(
        &self,
        id: &str,
        payload: &serde_json::Value,
        sequence_number: i64,
    ) -> Result<RequestRecord> {
        let record = RequestRecord::new(id.to_string(), payload.clone(), sequence_number);
        let created = record.created_at.timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO requests (id, payload, status, sequence_number, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(serde_json::to_string(payload)?)
        .bind(record.status.as_str())
        .bind(sequence_number)
        .bind(created)
        .bind(created)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_violation(e, id, sequence_number))?;

        debug!(request_id = %id, sequence = sequence_number, "Record created");
        Ok(record)
    }

    async fn update_status(&self, id: &str, status: RequestStatus) -> Result<()> {
        self.transition(id, status, None).await
    }

    async fn update_result(
        &self,
        id: &str,
        result: &serde_json::Value,
        status: RequestStatus,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(RecordError::NonTerminalResult(status));
        }
        self.transition(id, status, Some(result)).await
    }

    async fn get(&self, id: &str) -> Result<Option<RequestRecord>> {
        let row = sqlx::query(
            "SELECT id, payload, result, status, sequence_number, created_at, updated_at, completed_at \
             FROM requests WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn max_sequence_number(&self) -> Result<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(sequence_number) FROM requests")
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }
}

/// Name the column behind a UNIQUE failure on insert
fn unique_violation(e: sqlx::Error, id: &str, sequence_number: i64) -> RecordError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            if db.message().contains("sequence_number") {
                RecordError::DuplicateSequence(sequence_number)
            } else {
                RecordError::Duplicate(id.to_string())
            }
        }
        _ => e.into(),
    }
}
