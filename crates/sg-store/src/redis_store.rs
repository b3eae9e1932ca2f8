//! Redis-backed counter store
//!
//! Single-command operations go straight to Redis. Anything that reads and
//! then writes runs as a Lua script so it stays atomic across processes.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::{CounterStore, FloorDecrement, StoreConnector};

const INCR_WITH_EXPIRY: &str = r#"
    local count = redis.call("INCR", KEYS[1])
    if count == 1 then
        redis.call("PEXPIRE", KEYS[1], ARGV[1])
    end
    return count
"#;

const DECR_FLOOR_ZERO: &str = r#"
    local value = redis.call("DECR", KEYS[1])
    if value < 0 then
        redis.call("SET", KEYS[1], 0)
    end
    return value
"#;

const RAISE_TO: &str = r#"
    local current = tonumber(redis.call("GET", KEYS[1]) or "0")
    local floor = tonumber(ARGV[1])
    if floor > current then
        redis.call("SET", KEYS[1], ARGV[1])
        return floor
    end
    return current
"#;

// Slots are microseconds on the Redis server clock so that every process
// agrees on "now" regardless of local clock skew.
const RESERVE_SLOT: &str = r#"
    redis.replicate_commands()
    local t = redis.call("TIME")
    local now = tonumber(t[1]) * 1000000 + tonumber(t[2])
    local last = tonumber(redis.call("GET", KEYS[1]) or "0")
    local slot = last + tonumber(ARGV[1])
    if slot < now then
        slot = now
    end
    local ttl = math.floor((slot - now) / 1000) + tonumber(ARGV[2])
    redis.call("SET", KEYS[1], string.format("%.0f", slot), "PX", ttl)
    return slot - now
"#;

/// Slot register lifetime beyond the reserved slot
const SLOT_TTL_MS: u64 = 60_000;

const SCAN_COUNT: usize = 200;

pub struct RedisCounterStore {
    conn: ConnectionManager,
    incr_with_expiry: Script,
    decr_floor_zero: Script,
    raise_to: Script,
    reserve_slot: Script,
}

impl RedisCounterStore {
    /// Open a managed connection; the manager reconnects on its own afterwards
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let conn = ConnectionManager::new(client).await?;
        info!(url = %redact(redis_url), "Connected to Redis counter store");

        Ok(Self {
            conn,
            incr_with_expiry: Script::new(INCR_WITH_EXPIRY),
            decr_floor_zero: Script::new(DECR_FLOOR_ZERO),
            raise_to: Script::new(RAISE_TO),
            reserve_slot: Script::new(RESERVE_SLOT),
        })
    }
}

/// Connects `RedisCounterStore`s for `ReconnectingCounterStore`
pub struct RedisConnector {
    redis_url: String,
}

impl RedisConnector {
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self { redis_url: redis_url.into() }
    }
}

#[async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn CounterStore>> {
        let store = RedisCounterStore::connect(&self.redis_url).await?;
        Ok(Arc::new(store))
    }
}

/// Strip credentials from a Redis URL before logging it
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET").arg(key).arg(value).query_async(&mut conn).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = self
            .incr_with_expiry
            .key(key)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn decr_floor_zero(&self, key: &str) -> Result<FloorDecrement> {
        let mut conn = self.conn.clone();
        let raw: i64 = self.decr_floor_zero.key(key).invoke_async(&mut conn).await?;
        Ok(FloorDecrement { raw })
    }

    async fn raise_to(&self, key: &str, floor: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = self.raise_to.key(key).arg(floor).invoke_async(&mut conn).await?;
        Ok(value)
    }

    async fn reserve_slot(&self, key: &str, interval: Duration) -> Result<Duration> {
        let mut conn = self.conn.clone();
        let wait_micros: i64 = self
            .reserve_slot
            .key(key)
            .arg(interval.as_micros() as u64)
            .arg(SLOT_TTL_MS)
            .invoke_async(&mut conn)
            .await?;
        Ok(Duration::from_micros(wait_micros.max(0) as u64))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix = %prefix, count = keys.len(), "Scanned keys");
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(removed)
    }
}
