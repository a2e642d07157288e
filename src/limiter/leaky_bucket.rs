//! Leaky bucket rate limiting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::key::validate_key;
use super::mutex::KeyMutexTable;
use super::{now_unix_nanos, RateLimiter};
use crate::error::{Error, Result};
use crate::store::{LeakyBucketState, Store};

/// Safety-net TTL on bucket state; a bucket untouched for this long has
/// long since drained.
const STATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Queues requests in a bucket that drains one slot per leak interval,
/// smoothing traffic to a constant outflow rate.
pub struct LeakyBucketLimiter<S> {
    store: Arc<S>,
    capacity: u32,
    leak_interval: Duration,
    mutexes: KeyMutexTable,
}

impl<S: Store> LeakyBucketLimiter<S> {
    /// Create a new limiter holding up to `capacity` requests, draining
    /// one every `leak_interval`.
    pub fn new(store: Arc<S>, capacity: u32, leak_interval: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config(
                "capacity must be greater than zero".to_string(),
            ));
        }
        if leak_interval.is_zero() {
            return Err(Error::Config(
                "leak interval must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            store,
            capacity,
            leak_interval,
            mutexes: KeyMutexTable::new(),
        })
    }

    /// Check whether a request for `key` fits in the bucket, queueing it
    /// if so.
    pub async fn allow(&self, key: &str) -> Result<bool> {
        validate_key(key)?;

        let _guard = self.mutexes.lock(key).await;
        let now = now_unix_nanos();

        let mut state = self
            .store
            .get_leaky_bucket(key)
            .await?
            .unwrap_or(LeakyBucketState {
                queue: 0,
                last_leak_ns: now,
            });

        let interval_ns = self.leak_interval.as_nanos() as i64;
        let elapsed = (now - state.last_leak_ns).max(0);
        let leaked = elapsed / interval_ns;
        if leaked > 0 {
            state.queue = state
                .queue
                .saturating_sub(u32::try_from(leaked).unwrap_or(u32::MAX));
            // Snap forward by whole intervals, never to "now", so the
            // sub-interval remainder keeps accumulating.
            state.last_leak_ns += leaked * interval_ns;
        }

        let allowed = state.queue < self.capacity;
        if allowed {
            state.queue += 1;
        } else {
            debug!(key, queue = state.queue, "leaky bucket full");
        }

        // The state is written on deny too: the advanced last_leak must
        // persist or drained slots would be recounted.
        self.store.set_leaky_bucket(key, state, STATE_TTL).await?;
        Ok(allowed)
    }

    /// Stop the background mutex cleanup task. Subsequent calls are no-ops.
    pub fn stop_cleanup(&self) {
        self.mutexes.stop_cleanup();
    }
}

#[async_trait]
impl<S: Store> RateLimiter for LeakyBucketLimiter<S> {
    async fn allow(&self, key: &str) -> Result<bool> {
        LeakyBucketLimiter::allow(self, key).await
    }
}
