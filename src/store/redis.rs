//! Redis storage backend.
//!
//! Suitable for rate limiting across multiple service replicas: every
//! primitive is a single atomic server-side operation, so replicas
//! sharing a Redis instance agree on counter state. The connection
//! manager is owned by the caller and injected; this store does not
//! multiplex commands itself.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::{LeakyBucketState, Store, TokenBucketState};
use crate::error::{Error, Result};

/// Lua script for the counter increment. Runs atomically server-side:
/// clamps the counter at zero and arms the TTL only when this call
/// created the key (post-value equals the delta).
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if count < 0 then
    redis.call('SET', KEYS[1], '0')
    count = 0
end
if count == tonumber(ARGV[1]) then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return count
"#;

/// A Redis-backed implementation of the [`Store`] trait.
///
/// ```no_run
/// # async fn example() -> keygate::Result<()> {
/// let client = redis::Client::open("redis://127.0.0.1/")?;
/// let manager = redis::aio::ConnectionManager::new(client).await?;
/// let store = keygate::RedisStore::new(manager);
/// # Ok(())
/// # }
/// ```
pub struct RedisStore {
    conn: ConnectionManager,
    increment_script: Script,
}

impl RedisStore {
    /// Create a new store over an established connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            increment_script: Script::new(INCREMENT_SCRIPT),
        }
    }
}

/// EXPIRE takes whole seconds; floor sub-second TTLs at one second
/// rather than zero (EXPIRE 0 deletes the key immediately).
fn ttl_secs(ttl: Duration) -> i64 {
    (ttl.as_secs() as i64).max(1)
}

fn parse_field<T: FromStr>(
    fields: &HashMap<String, String>,
    key: &str,
    field: &'static str,
) -> Result<T> {
    let raw = fields.get(field).ok_or_else(|| Error::MalformedState {
        key: key.to_string(),
        detail: format!("missing hash field `{field}`"),
    })?;
    raw.parse().map_err(|_| Error::MalformedState {
        key: key.to_string(),
        detail: format!("unparseable hash field `{field}`: {raw:?}"),
    })
}

#[async_trait]
impl Store for RedisStore {
    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let mut conn = self.conn.clone();
        let count: i64 = self
            .increment_script
            .key(key)
            .arg(delta)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn get_counter(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let count: Option<i64> = conn.get(key).await?;
        Ok(count.unwrap_or(0))
    }

    async fn add_timestamp(&self, key: &str, timestamp_ns: i64, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, timestamp_ns, timestamp_ns).await?;
        // Refreshing the TTL on every write is fine: reads trim, so the
        // set never outlives the window by more than the TTL.
        let _: () = conn.expire(key, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn count_timestamps(&self, key: &str, start_ns: i64, end_ns: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zrembyscore(key, "-inf", format!("({start_ns}"))
            .await?;
        let count: i64 = conn.zcount(key, start_ns, end_ns).await?;
        Ok(count)
    }

    async fn get_token_bucket(&self, key: &str) -> Result<Option<TokenBucketState>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(TokenBucketState {
            tokens: parse_field(&fields, key, "tokens")?,
            last_update_ns: parse_field(&fields, key, "last_update")?,
        }))
    }

    async fn set_token_bucket(
        &self,
        key: &str,
        state: TokenBucketState,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(
                key,
                &[
                    ("tokens", state.tokens.to_string()),
                    ("last_update", state.last_update_ns.to_string()),
                ],
            )
            .await?;
        let _: () = conn.expire(key, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn get_leaky_bucket(&self, key: &str) -> Result<Option<LeakyBucketState>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(LeakyBucketState {
            queue: parse_field(&fields, key, "queue")?,
            last_leak_ns: parse_field(&fields, key, "last_leak_time")?,
        }))
    }

    async fn set_leaky_bucket(
        &self,
        key: &str,
        state: LeakyBucketState,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(
                key,
                &[
                    ("queue", state.queue.to_string()),
                    ("last_leak_time", state.last_leak_ns.to_string()),
                ],
            )
            .await?;
        let _: () = conn.expire(key, ttl_secs(ttl)).await?;
        Ok(())
    }
}
