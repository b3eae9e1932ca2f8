//! Counter store housekeeping
//!
//! Deletes admission window keys older than the retention threshold. Sweeps
//! are throttled through the shared `last_cleanup` register.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use sg_config::HousekeepingConfig;
use sg_store::{CounterKeys, CounterStore};

use crate::metrics;
use crate::Result;

/// What a sweep did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// The last sweep was too recent
    Throttled,
    Swept { scanned: usize, deleted: u64 },
}

#[derive(Clone)]
pub struct Housekeeper {
    store: Arc<dyn CounterStore>,
    keys: CounterKeys,
    config: HousekeepingConfig,
}

impl Housekeeper {
    pub fn new(store: Arc<dyn CounterStore>, keys: CounterKeys, config: HousekeepingConfig) -> Self {
        Self { store, keys, config }
    }

    /// Whether dispatching `sequence_number` should trigger a sweep
    pub fn is_due(&self, sequence_number: i64) -> bool {
        sequence_number > 0 && sequence_number % self.config.every_n_sequences == 0
    }

    /// Sweep using the current wall-clock second
    pub async fn sweep(&self) -> Result<SweepOutcome> {
        self.sweep_at(Utc::now().timestamp()).await
    }

    pub async fn sweep_at(&self, now_secs: i64) -> Result<SweepOutcome> {
        let last_cleanup = self.store.get(&self.keys.last_cleanup()).await?.unwrap_or(0);
        if now_secs - last_cleanup <= self.config.min_interval_secs as i64 {
            debug!(last_cleanup, "Housekeeping skipped, last sweep too recent");
            return Ok(SweepOutcome::Throttled);
        }

        let candidates = self.store.keys_with_prefix(&self.keys.input_window_prefix()).await?;
        let retention = self.config.retention_secs as i64;
        let stale: Vec<String> = candidates
            .iter()
            .filter(|key| {
                self.keys
                    .parse_input_window(key)
                    .is_some_and(|window| now_secs - window as i64 > retention)
            })
            .cloned()
            .collect();

        let deleted = self.store.delete(&stale).await?;
        self.store.set(&self.keys.last_cleanup(), now_secs).await?;

        metrics::record_housekeeping(deleted);
        info!(scanned = candidates.len(), deleted, "Cleaned up old admission window keys");
        Ok(SweepOutcome::Swept {
            scanned: candidates.len(),
            deleted,
        })
    }

    /// Run a sweep in the background; failures are logged and otherwise ignored
    pub fn spawn_sweep(&self) {
        let housekeeper = self.clone();
        tokio::spawn(async move {
            if let Err(e) = housekeeper.sweep().await {
                warn!(error = %e, "Housekeeping sweep failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sg_store::{InMemoryCounterStore, UnreachableCounterStore};

    const NOW: i64 = 1_700_000_000;

    fn housekeeper(store: Arc<dyn CounterStore>) -> Housekeeper {
        Housekeeper::new(store, CounterKeys::new("t"), HousekeepingConfig::default())
    }

    #[test]
    fn test_is_due() {
        let hk = housekeeper(Arc::new(InMemoryCounterStore::new()));
        assert!(hk.is_due(100));
        assert!(hk.is_due(300));
        assert!(!hk.is_due(0));
        assert!(!hk.is_due(99));
        assert!(!hk.is_due(-100));
    }

    #[tokio::test]
    async fn test_deletes_only_old_window_keys() {
        let store = Arc::new(InMemoryCounterStore::new());
        let keys = CounterKeys::new("t");
        store.set(&keys.input_window((NOW - 120) as u64), 5).await.unwrap();
        store.set(&keys.input_window((NOW - 61) as u64), 5).await.unwrap();
        store.set(&keys.input_window((NOW - 60) as u64), 5).await.unwrap();
        store.set(&keys.input_window(NOW as u64), 5).await.unwrap();
        store.set(&keys.queue_size(), 42).await.unwrap();

        let outcome = housekeeper(store.clone()).sweep_at(NOW).await.unwrap();
        assert_eq!(outcome, SweepOutcome::Swept { scanned: 4, deleted: 2 });

        assert_eq!(store.get(&keys.input_window((NOW - 60) as u64)).await.unwrap(), Some(5));
        assert_eq!(store.get(&keys.queue_size()).await.unwrap(), Some(42));
        assert_eq!(store.get(&keys.last_cleanup()).await.unwrap(), Some(NOW));
    }

    #[tokio::test]
    async fn test_throttled_within_min_interval() {
        let store = Arc::new(InMemoryCounterStore::new());
        let hk = housekeeper(store);

        assert!(matches!(hk.sweep_at(NOW).await.unwrap(), SweepOutcome::Swept { .. }));
        assert_eq!(hk.sweep_at(NOW + 300).await.unwrap(), SweepOutcome::Throttled);
        assert!(matches!(hk.sweep_at(NOW + 301).await.unwrap(), SweepOutcome::Swept { .. }));
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error_not_a_panic() {
        let hk = housekeeper(Arc::new(UnreachableCounterStore::new("down")));
        assert!(hk.sweep_at(NOW).await.is_err());
    }
}
