use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use sg_common::{RequestRecord, RequestStatus};
use crate::{RecordError, RecordStore, Result};

/// Record store held in process memory
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: Mutex<HashMap<String, RequestRecord>>,
    fail_writes: AtomicBool,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail, for exercising best-effort persistence paths
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(RecordError::Database("writes disabled".to_string()))
        } else {
            Ok(())
        }
    }

    fn transition(
        &self,
        id: &str,
        status: RequestStatus,
        result: Option<&serde_json::Value>,
    ) -> Result<()> {
        self.check_writable()?;
        let mut records = self.records.lock();
        let record = records
            .get_mut(id)
            .ok_or_else(|| RecordError::NotFound(id.to_string()))?;

        if !record.status.can_transition_to(status) {
            return Err(RecordError::InvalidTransition {
                id: id.to_string(),
                from: record.status,
                to: status,
            });
        }

        let now = Utc::now();
        record.status = status;
        record.updated_at = now;
        if let Some(result) = result {
            record.result = Some(result.clone());
        }
        if status.is_terminal() {
            record.completed_at = Some(now);
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create(
        &self,
        id: &str,
        payload: &serde_json::Value,
        sequence_number: i64,
    ) -> Result<RequestRecord> {
        self.check_writable()?;
        let mut records = self.records.lock();
        if records.contains_key(id) {
            return Err(RecordError::Duplicate(id.to_string()));
        }
        if records.values().any(|r| r.sequence_number == sequence_number) {
            return Err(RecordError::DuplicateSequence(sequence_number));
        }
        let record = RequestRecord::new(id.to_string(), payload.clone(), sequence_number);
        records.insert(id.to_string(), record.clone());
        Ok(record)
    }

    async fn update_status(&self, id: &str, status: RequestStatus) -> Result<()> {
        self.transition(id, status, None)
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
        self.transition(id, status, Some(result))
    }

    async fn get(&self, id: &str) -> Result<Option<RequestRecord>> {
        Ok(self.records.lock().get(id).cloned())
    }

    async fn max_sequence_number(&self) -> Result<Option<i64>> {
        Ok(self.records.lock().values().map(|r| r.sequence_number).max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_lifecycle() {
        let store = InMemoryRecordStore::new();
        let created = store.create("r1", &json!({"prompt": "hi"}), 7).await.unwrap();
        assert_eq!(created.status, RequestStatus::Pending);
        assert!(created.result.is_none());

        store.update_status("r1", RequestStatus::Processing).await.unwrap();
        store
            .update_result("r1", &json!({"answer": 42}), RequestStatus::Completed)
            .await
            .unwrap();

        let record = store.get("r1").await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
        assert_eq!(record.sequence_number, 7);
        assert_eq!(record.result, Some(json!({"answer": 42})));
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_rejects_back_transitions() {
        let store = InMemoryRecordStore::new();
        store.create("r1", &json!({}), 1).await.unwrap();
        store
            .update_result("r1", &json!({"error": "boom"}), RequestStatus::Failed)
            .await
            .unwrap();

        let err = store.update_status("r1", RequestStatus::Processing).await.unwrap_err();
        assert!(matches!(err, RecordError::InvalidTransition { .. }));

        let err = store
            .update_result("r1", &json!({}), RequestStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, RecordError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_result_requires_terminal_status() {
        let store = InMemoryRecordStore::new();
        store.create("r1", &json!({}), 1).await.unwrap();
        assert!(store
            .update_result("r1", &json!({}), RequestStatus::Processing)
            .await
            .is_err_and(|e| matches!(e, RecordError::NonTerminalResult(_))));
    }

    #[tokio::test]
    async fn test_duplicate_and_missing() {
        let store = InMemoryRecordStore::new();
        store.create("r1", &json!({}), 1).await.unwrap();
        assert!(matches!(
            store.create("r1", &json!({}), 2).await,
            Err(RecordError::Duplicate(_))
        ));
        assert!(matches!(
            store.update_status("nope", RequestStatus::Processing).await,
            Err(RecordError::NotFound(_))
        ));
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sequence_collision_and_max() {
        let store = InMemoryRecordStore::new();
        assert_eq!(store.max_sequence_number().await.unwrap(), None);

        store.create("r1", &json!({}), 4).await.unwrap();
        store.create("r2", &json!({}), 9).await.unwrap();
        assert!(matches!(
            store.create("r3", &json!({}), 4).await,
            Err(RecordError::DuplicateSequence(4))
        ));
        assert!(store.get("r3").await.unwrap().is_none());
        assert_eq!(store.max_sequence_number().await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let store = InMemoryRecordStore::new();
        store.set_fail_writes(true);
        assert!(store.create("r1", &json!({}), 1).await.is_err());
        store.set_fail_writes(false);
        assert!(store.create("r1", &json!({}), 1).await.is_ok());
    }
}
