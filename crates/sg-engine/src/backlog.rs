//! Backlog depth tracking
//!
//! Depth is the number of admitted requests that have not reached a terminal
//! state. It lives in the shared counter store, so every admitter and worker
//! process sees the same value.

use std::sync::Arc;
use tracing::{debug, warn};

use sg_store::{CounterKeys, CounterStore};

use crate::metrics;
use crate::Result;

#[derive(Clone)]
pub struct BacklogTracker {
    store: Arc<dyn CounterStore>,
    key: String,
}

impl BacklogTracker {
    pub fn new(store: Arc<dyn CounterStore>, keys: &CounterKeys) -> Self {
        Self {
            store,
            key: keys.queue_size(),
        }
    }

    /// Count one newly admitted request
    pub async fn increment(&self) -> Result<u64> {
        let depth = self.store.incr(&self.key).await?.max(0) as u64;
        metrics::set_backlog_depth(depth);
        debug!(depth, "Backlog incremented");
        Ok(depth)
    }

    /// Release one request that reached a terminal state.
    ///
    /// A decrement that would go negative leaves the depth at zero and is
    /// reported as an anomaly, not an error.
    pub async fn decrement(&self) -> Result<u64> {
        let outcome = self.store.decr_floor_zero(&self.key).await?;
        if outcome.clamped() {
            warn!(raw = outcome.raw, "Backlog depth went negative, clamped to zero");
            metrics::record_backlog_clamped();
        }
        let depth = outcome.value() as u64;
        metrics::set_backlog_depth(depth);
        Ok(depth)
    }

    /// Current depth; a missing register reads as zero
    pub async fn read(&self) -> Result<u64> {
        let depth = self.store.get(&self.key).await?.unwrap_or(0).max(0) as u64;
        Ok(depth)
    }

    /// Overwrite the depth. Used to seed tests and by operators resetting a drifted counter.
    pub async fn reset_to(&self, depth: u64) -> Result<()> {
        self.store.set(&self.key, depth as i64).await?;
        metrics::set_backlog_depth(depth);
        Ok(())
    }
}
