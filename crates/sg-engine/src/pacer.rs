//! Output Pacer
//!
//! A single global token shared by every worker in every process: dispatches
//! are spaced at least `min_interval` apart. Each caller atomically reserves
//! the next free slot in the counter store and then sleeps until it arrives,
//! so the wait happens outside the critical section.
//!
//! Without the store each worker falls back to sleeping `min_interval` on its
//! own. That keeps a single worker from flooding the downstream but loses the
//! global spacing.

use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

use sg_store::{CounterKeys, CounterStore};

use crate::metrics;

/// Result of one `wait_for_slot` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacerSlot {
    /// Time spent suspended before the slot was reached
    pub waited: Duration,
    /// The slot came from the local fallback, not the shared store
    pub degraded: bool,
}

#[derive(Clone)]
pub struct OutputPacer {
    store: Arc<dyn CounterStore>,
    key: String,
    min_interval: Duration,
}

impl OutputPacer {
    pub fn new(store: Arc<dyn CounterStore>, keys: &CounterKeys, max_output_rps: u32) -> Self {
        Self {
            store,
            key: keys.last_dispatch(),
            min_interval: Duration::from_secs_f64(1.0 / max_output_rps.max(1) as f64),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Suspend the calling worker until it may dispatch
    pub async fn wait_for_slot(&self) -> PacerSlot {
        let slot = match self.store.reserve_slot(&self.key, self.min_interval).await {
            Ok(wait) => PacerSlot { waited: wait, degraded: false },
            Err(e) => {
                warn!(error = %e, "Counter store unreachable, pacing locally");
                metrics::record_store_degraded("pacer");
                PacerSlot { waited: self.min_interval, degraded: true }
            }
        };

        if !slot.waited.is_zero() {
            tokio::time::sleep(slot.waited).await;
        }

        trace!(waited_ms = slot.waited.as_millis() as u64, degraded = slot.degraded, "Pacer slot reached");
        metrics::record_pacer_wait(slot.waited, slot.degraded);
        slot
    }
}
