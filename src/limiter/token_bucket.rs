//! Token bucket rate limiting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::key::validate_key;
use super::mutex::KeyMutexTable;
use super::{now_unix_nanos, RateLimiter};
use crate::error::{Error, Result};
use crate::store::{Store, TokenBucketState};

/// Safety-net TTL on bucket state; a bucket untouched for this long is
/// indistinguishable from a full one.
const STATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Allows bursts up to a capacity while refilling tokens at a steady
/// rate. Tokens are fractional, so average throughput equals the refill
/// rate exactly under steady traffic.
pub struct TokenBucketLimiter<S> {
    store: Arc<S>,
    capacity: f64,
    refill_rate: f64,
    mutexes: KeyMutexTable,
}

impl<S: Store> TokenBucketLimiter<S> {
    /// Create a new limiter with `capacity` burst tokens refilled at
    /// `refill_rate` tokens per second.
    pub fn new(store: Arc<S>, capacity: f64, refill_rate: f64) -> Result<Self> {
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(Error::Config(
                "capacity must be a positive finite number".to_string(),
            ));
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(Error::Config(
                "refill rate must be a positive finite number".to_string(),
            ));
        }
        Ok(Self {
            store,
            capacity,
            refill_rate,
            mutexes: KeyMutexTable::new(),
        })
    }

    /// Check whether a request for `key` is allowed, consuming one token
    /// if so.
    pub async fn allow(&self, key: &str) -> Result<bool> {
        validate_key(key)?;

        let _guard = self.mutexes.lock(key).await;
        let now = now_unix_nanos();

        let mut state = self
            .store
            .get_token_bucket(key)
            .await?
            .unwrap_or(TokenBucketState {
                tokens: self.capacity,
                last_update_ns: now,
            });

        // A clock regression reads as zero elapsed time.
        let elapsed_secs = (now - state.last_update_ns).max(0) as f64 / NANOS_PER_SEC;
        state.tokens = (state.tokens + elapsed_secs * self.refill_rate).min(self.capacity);
        state.last_update_ns = now;

        let allowed = state.tokens >= 1.0;
        if allowed {
            state.tokens -= 1.0;
        } else {
            debug!(key, tokens = state.tokens, "token bucket exhausted");
        }

        // The refilled state is written on deny as well, keeping
        // last_update consistent with the refill just computed.
        self.store.set_token_bucket(key, state, STATE_TTL).await?;
        Ok(allowed)
    }

    /// Stop the background mutex cleanup task. Subsequent calls are no-ops.
    pub fn stop_cleanup(&self) {
        self.mutexes.stop_cleanup();
    }
}

#[async_trait]
impl<S: Store> RateLimiter for TokenBucketLimiter<S> {
    async fn allow(&self, key: &str) -> Result<bool> {
        TokenBucketLimiter::allow(self, key).await
    }
}
