//! Global request sequencing

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use sg_records::RecordStore;
use sg_store::{CounterKeys, CounterStore};

use crate::metrics;
use crate::Result;

/// Modulus of the clock-derived fallback sequence
const DEGRADED_SEQUENCE_MODULUS: i64 = 1_000_000;

/// A sequence number and how it was obtained.
///
/// Degraded values come from the local clock; they roughly preserve order but
/// may collide with each other or with store-issued values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sequence {
    pub value: i64,
    pub degraded: bool,
}

#[derive(Clone)]
pub struct Sequencer {
    store: Arc<dyn CounterStore>,
    key: String,
}

impl Sequencer {
    pub fn new(store: Arc<dyn CounterStore>, keys: &CounterKeys) -> Self {
        Self {
            store,
            key: keys.sequence(),
        }
    }

    /// Next value of the shared counter, never failing
    pub async fn next(&self) -> Sequence {
        match self.store.incr(&self.key).await {
            Ok(value) => Sequence { value, degraded: false },
            Err(e) => {
                let value = Utc::now().timestamp_millis() % DEGRADED_SEQUENCE_MODULUS;
                warn!(error = %e, sequence = value, "Counter store unreachable, using clock-derived sequence");
                metrics::record_store_degraded("sequencer");
                Sequence { value, degraded: true }
            }
        }
    }

    /// Raise the shared counter past every sequence number already held by
    /// `records`, so a reset or flushed counter cannot hand out a used value.
    pub async fn resume_after(&self, records: &dyn RecordStore) -> Result<Option<i64>> {
        let Some(max) = records.max_sequence_number().await? else {
            return Ok(None);
        };
        let value = self.store.raise_to(&self.key, max).await?;
        info!(max_recorded = max, sequence = value, "Sequencer resumed after stored records");
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sg_records::InMemoryRecordStore;
    use sg_store::{InMemoryCounterStore, UnreachableCounterStore};
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_sequence_starts_at_one_and_increases() {
        let sequencer = Sequencer::new(Arc::new(InMemoryCounterStore::new()), &CounterKeys::new("t"));
        let values: Vec<i64> = {
            let mut v = Vec::new();
            for _ in 0..5 {
                let seq = sequencer.next().await;
                assert!(!seq.degraded);
                v.push(seq.value);
            }
            v
        };
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_concurrent_callers_get_unique_values() {
        let sequencer = Sequencer::new(Arc::new(InMemoryCounterStore::new()), &CounterKeys::new("t"));
        let mut handles = Vec::new();
        for _ in 0..100 {
            let sequencer = sequencer.clone();
            handles.push(tokio::spawn(async move { sequencer.next().await.value }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }
        assert_eq!(seen.len(), 100);
        assert_eq!(seen.iter().max(), Some(&100));
    }

    #[tokio::test]
    async fn test_resume_after_stored_records() {
        let records = InMemoryRecordStore::new();
        let sequencer = Sequencer::new(Arc::new(InMemoryCounterStore::new()), &CounterKeys::new("t"));
        assert_eq!(sequencer.resume_after(&records).await.unwrap(), None);

        records.create("a", &json!({}), 41).await.unwrap();
        assert_eq!(sequencer.resume_after(&records).await.unwrap(), Some(41));
        assert_eq!(sequencer.next().await.value, 42);

        // Never moves the counter backwards
        for _ in 0..10 {
            sequencer.next().await;
        }
        assert_eq!(sequencer.resume_after(&records).await.unwrap(), Some(52));
        assert_eq!(sequencer.next().await.value, 53);
    }

    #[tokio::test]
    async fn test_degraded_fallback_is_flagged() {
        let sequencer = Sequencer::new(
            Arc::new(UnreachableCounterStore::new("down")),
            &CounterKeys::new("t"),
        );
        let seq = sequencer.next().await;
        assert!(seq.degraded);
        assert!((0..DEGRADED_SEQUENCE_MODULUS).contains(&seq.value));
    }
}
