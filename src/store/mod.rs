//! Storage backends for rate limiter state.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// State of a token bucket.
///
/// Tokens are fractional so that refill accounting never rounds away
/// sub-token amounts; under steady traffic the average throughput equals
/// the refill rate exactly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketState {
    /// Current number of tokens in the bucket.
    pub tokens: f64,
    /// Unix timestamp in nanoseconds of the last refill computation.
    pub last_update_ns: i64,
}

/// State of a leaky bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakyBucketState {
    /// Number of requests currently queued in the bucket.
    pub queue: u32,
    /// Unix timestamp in nanoseconds of the last leak boundary.
    /// Advances in whole multiples of the leak interval, never to "now",
    /// so sub-interval fractions accumulate.
    pub last_leak_ns: i64,
}

/// Abstract backend used by the rate limiting algorithms.
///
/// A store offers three groups of primitives: expiring counters,
/// timestamp sets, and structured bucket state. Any implementation of
/// this trait can be plugged into any of the limiters.
#[async_trait]
pub trait Store: Send + Sync {
    /// Atomically add `delta` to the counter at `key` and return the
    /// post-value, clamped at zero. The TTL is armed only when this call
    /// creates the counter (or re-creates it after expiry), which is what
    /// gives fixed windows their self-disposing keys.
    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64>;

    /// Current counter value, or 0 if the key is absent or expired.
    async fn get_counter(&self, key: &str) -> Result<i64>;

    /// Append a timestamp to the set at `key`, refreshing the TTL.
    async fn add_timestamp(&self, key: &str, timestamp_ns: i64, ttl: Duration) -> Result<()>;

    /// Remove timestamps with score below `start_ns`, then count those in
    /// `[start_ns, end_ns]`. The trim is a required side effect: it is
    /// what bounds the memory held per key.
    async fn count_timestamps(&self, key: &str, start_ns: i64, end_ns: i64) -> Result<i64>;

    /// Read the token bucket state at `key`, if present.
    async fn get_token_bucket(&self, key: &str) -> Result<Option<TokenBucketState>>;

    /// Write the token bucket state at `key` and arm the TTL.
    async fn set_token_bucket(
        &self,
        key: &str,
        state: TokenBucketState,
        ttl: Duration,
    ) -> Result<()>;

    /// Read the leaky bucket state at `key`, if present.
    async fn get_leaky_bucket(&self, key: &str) -> Result<Option<LeakyBucketState>>;

    /// Write the leaky bucket state at `key` and arm the TTL.
    async fn set_leaky_bucket(
        &self,
        key: &str,
        state: LeakyBucketState,
        ttl: Duration,
    ) -> Result<()>;
}
