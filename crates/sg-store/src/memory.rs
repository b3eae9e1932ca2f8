//! In-process counter stores
//!
//! `InMemoryCounterStore` mirrors the Redis semantics inside one process and
//! runs on `tokio::time`, so tests with a paused clock control expiry and
//! pacing deterministically.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Result, StoreError};
use crate::{CounterStore, FloorDecrement};

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

pub struct InMemoryCounterStore {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
    epoch: Instant,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            epoch: Instant::now(),
        }
    }

    /// Simulate an outage; every operation fails while unavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()))
        }
    }

    /// Run `f` on the live entry map with expired entries already evicted
    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> T) -> Result<T> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(f(&mut entries, now))
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        self.with_entries(|entries, _| entries.get(key).map(|e| e.value))
    }

    async fn set(&self, key: &str, value: i64) -> Result<()> {
        self.with_entries(|entries, _| {
            entries.insert(key.to_string(), Entry { value, expires_at: None });
        })
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.with_entries(|entries, _| {
            let entry = entries
                .entry(key.to_string())
                .or_insert(Entry { value: 0, expires_at: None });
            entry.value += 1;
            entry.value
        })
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64> {
        self.with_entries(|entries, now| {
            let entry = entries
                .entry(key.to_string())
                .or_insert(Entry { value: 0, expires_at: None });
            entry.value += 1;
            if entry.value == 1 {
                entry.expires_at = Some(now + ttl);
            }
            entry.value
        })
    }

    async fn decr_floor_zero(&self, key: &str) -> Result<FloorDecrement> {
        self.with_entries(|entries, _| {
            let entry = entries
                .entry(key.to_string())
                .or_insert(Entry { value: 0, expires_at: None });
            let raw = entry.value - 1;
            entry.value = raw.max(0);
            FloorDecrement { raw }
        })
    }

    async fn raise_to(&self, key: &str, floor: i64) -> Result<i64> {
        self.with_entries(|entries, _| {
            let entry = entries
                .entry(key.to_string())
                .or_insert(Entry { value: 0, expires_at: None });
            entry.value = entry.value.max(floor);
            entry.value
        })
    }

    async fn reserve_slot(&self, key: &str, interval: Duration) -> Result<Duration> {
        let epoch = self.epoch;
        self.with_entries(|entries, now| {
            let now_micros = now.duration_since(epoch).as_micros() as i64;
            let last = entries.get(key).map(|e| e.value);
            let slot = match last {
                Some(last) => (last + interval.as_micros() as i64).max(now_micros),
                None => now_micros,
            };
            entries.insert(key.to_string(), Entry { value: slot, expires_at: None });
            Duration::from_micros((slot - now_micros) as u64)
        })
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.with_entries(|entries, _| {
            entries
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect()
        })
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.with_entries(|entries, _| {
            keys.iter().filter(|k| entries.remove(k.as_str()).is_some()).count() as u64
        })
    }
}

/// Store used when the configured backend could not be reached at startup.
///
/// Every call fails, which drives the core into its degraded paths instead of
/// refusing to start.
pub struct UnreachableCounterStore {
    reason: String,
}

impl UnreachableCounterStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    fn fail<T>(&self) -> Result<T> {
        Err(StoreError::Unavailable(self.reason.clone()))
    }
}

#[async_trait]
impl CounterStore for UnreachableCounterStore {
    fn backend(&self) -> &'static str {
        "unreachable"
    }

    async fn ping(&self) -> Result<()> {
        self.fail()
    }

    async fn get(&self, _key: &str) -> Result<Option<i64>> {
        self.fail()
    }

    async fn set(&self, _key: &str, _value: i64) -> Result<()> {
        self.fail()
    }

    async fn incr(&self, _key: &str) -> Result<i64> {
        self.fail()
    }

    async fn incr_with_expiry(&self, _key: &str, _ttl: Duration) -> Result<i64> {
        self.fail()
    }

    async fn decr_floor_zero(&self, _key: &str) -> Result<FloorDecrement> {
        self.fail()
    }

    async fn raise_to(&self, _key: &str, _floor: i64) -> Result<i64> {
        self.fail()
    }

    async fn reserve_slot(&self, _key: &str, _interval: Duration) -> Result<Duration> {
        self.fail()
    }

    async fn keys_with_prefix(&self, _prefix: &str) -> Result<Vec<String>> {
        self.fail()
    }

    async fn delete(&self, _keys: &[String]) -> Result<u64> {
        self.fail()
    }
}
