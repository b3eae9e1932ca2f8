//! Surgegate Shared Counter Store
//!
//! Atomically-incrementable integer registers with optional expiry, visible to
//! every admitter and worker process. All cross-process coordination in the
//! core goes through this trait.
//!
//! # Backends
//!
//! - **Redis**: production store, multi-step operations run as Lua scripts
//! - **Memory**: single-process store for tests and local development
//! - **Unreachable**: always fails, used when Redis cannot be reached at startup
//! - **Reconnecting**: wraps a fallback and swaps in Redis once it answers
//!
//! # Example
//!
//! ```no_run
//! use sg_store::{CounterStore, CounterKeys, RedisCounterStore};
//!
//! async fn example() -> sg_store::Result<()> {
//!     let store = RedisCounterStore::connect("redis://localhost:6379").await?;
//!     let keys = CounterKeys::new("surgegate");
//!     let depth = store.incr(&keys.queue_size()).await?;
//!     println!("backlog depth is now {depth}");
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use std::time::Duration;

mod error;
mod keys;
mod memory;
mod reconnect;
mod redis_store;

pub use error::{StoreError, Result};
pub use keys::CounterKeys;
pub use memory::{InMemoryCounterStore, UnreachableCounterStore};
pub use reconnect::{ReconnectingCounterStore, StoreConnector};
pub use redis_store::{RedisConnector, RedisCounterStore};

/// Outcome of a decrement that is floored at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloorDecrement {
    /// Value right after the decrement, before clamping
    pub raw: i64,
}

impl FloorDecrement {
    /// Value visible to readers after the operation
    pub fn value(&self) -> i64 {
        self.raw.max(0)
    }

    /// The decrement would have gone below zero and was reset to zero
    pub fn clamped(&self) -> bool {
        self.raw < 0
    }
}

/// Atomic single-key operations on shared integer registers.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short backend name for logs and diagnostics
    fn backend(&self) -> &'static str;

    /// Check that the store answers
    async fn ping(&self) -> Result<()>;

    /// Read a register, `None` if it does not exist or has expired
    async fn get(&self, key: &str) -> Result<Option<i64>>;

    /// Overwrite a register without expiry
    async fn set(&self, key: &str, value: i64) -> Result<()>;

    /// Atomically add one and return the new value
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Atomically add one; the first increment of a fresh key arms `ttl`
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// Atomically subtract one, resetting the register to zero if it went negative
    async fn decr_floor_zero(&self, key: &str) -> Result<FloorDecrement>;

    /// Atomically raise a register to at least `floor`, returning the resulting value.
    /// A register already at or above `floor` is left alone.
    async fn raise_to(&self, key: &str, floor: i64) -> Result<i64>;

    /// Reserve the next dispatch slot spaced at least `interval` after the
    /// previously reserved one, and return how long the caller must wait for it.
    ///
    /// The read-compare-write on the stored slot is atomic, so concurrent
    /// callers always receive distinct slots `interval` apart.
    async fn reserve_slot(&self, key: &str, interval: Duration) -> Result<Duration>;

    /// List keys starting with `prefix`
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64>;
}
