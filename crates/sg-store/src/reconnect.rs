//! Counter store that recovers from a failed startup connection
//!
//! Starts on a fallback (normally `UnreachableCounterStore`) and retries the
//! real backend in the background with exponential backoff. Once connected,
//! every later call goes to the live store.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::Result;
use crate::{CounterStore, FloorDecrement};

/// Opens a connection to a counter store backend
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn CounterStore>>;
}

pub struct ReconnectingCounterStore {
    current: RwLock<Arc<dyn CounterStore>>,
    connected: AtomicBool,
}

impl ReconnectingCounterStore {
    pub fn new(fallback: Arc<dyn CounterStore>) -> Self {
        Self {
            current: RwLock::new(fallback),
            connected: AtomicBool::new(false),
        }
    }

    /// The live backend has replaced the fallback
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn current(&self) -> Arc<dyn CounterStore> {
        self.current.read().clone()
    }

    /// Retry `connector` until it succeeds, doubling the delay up to `max_backoff`
    pub async fn reconnect(&self, connector: &dyn StoreConnector, initial_backoff: Duration, max_backoff: Duration) {
        let mut backoff = initial_backoff;
        let mut attempts = 0u32;

        loop {
            tokio::time::sleep(backoff).await;
            attempts += 1;

            match connector.connect().await {
                Ok(store) => {
                    *self.current.write() = store;
                    self.connected.store(true, Ordering::SeqCst);
                    info!(attempts, "Counter store reachable again, leaving degraded mode");
                    return;
                }
                Err(e) => {
                    backoff = (backoff * 2).min(max_backoff);
                    warn!(
                        attempt = attempts,
                        retry_in_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Counter store still unreachable"
                    );
                }
            }
        }
    }

    pub fn spawn_reconnect(
        self: &Arc<Self>,
        connector: Arc<dyn StoreConnector>,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            store.reconnect(connector.as_ref(), initial_backoff, max_backoff).await;
        })
    }
}

#[async_trait]
impl CounterStore for ReconnectingCounterStore {
    fn backend(&self) -> &'static str {
        self.current().backend()
    }

    async fn ping(&self) -> Result<()> {
        self.current().ping().await
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        self.current().get(key).await
    }

    async fn set(&self, key: &str, value: i64) -> Result<()> {
        self.current().set(key, value).await
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.current().incr(key).await
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64> {
        self.current().incr_with_expiry(key, ttl).await
    }

    async fn decr_floor_zero(&self, key: &str) -> Result<FloorDecrement> {
        self.current().decr_floor_zero(key).await
    }

    async fn raise_to(&self, key: &str, floor: i64) -> Result<i64> {
        self.current().raise_to(key, floor).await
    }

    async fn reserve_slot(&self, key: &str, interval: Duration) -> Result<Duration> {
        self.current().reserve_slot(key, interval).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.current().keys_with_prefix(prefix).await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.current().delete(keys).await
    }
}
