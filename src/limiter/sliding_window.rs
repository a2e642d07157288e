//! Sliding window rate limiting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::key::validate_key;
use super::mutex::KeyMutexTable;
use super::{now_unix_nanos, RateLimiter};
use crate::error::{Error, Result};
use crate::store::Store;

/// Limits requests over a window that slides with each request, using a
/// per-key set of request timestamps.
///
/// Decisions count first and record second: under the per-key mutex this
/// keeps the stored count at or below the limit, and denied requests
/// leave no timestamp behind to delay recovery.
pub struct SlidingWindowLimiter<S> {
    store: Arc<S>,
    limit: u32,
    window: Duration,
    mutexes: KeyMutexTable,
}

impl<S: Store> SlidingWindowLimiter<S> {
    /// Create a new limiter allowing `limit` requests per sliding `window`.
    pub fn new(store: Arc<S>, limit: u32, window: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(Error::Config("limit must be greater than zero".to_string()));
        }
        if window.is_zero() {
            return Err(Error::Config(
                "window duration must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            store,
            limit,
            window,
            mutexes: KeyMutexTable::new(),
        })
    }

    /// Check whether a request for `key` is allowed under the limit.
    pub async fn allow(&self, key: &str) -> Result<bool> {
        validate_key(key)?;

        let _guard = self.mutexes.lock(key).await;
        let now = now_unix_nanos();
        let window_start = now - self.window.as_nanos() as i64;

        let count = self.store.count_timestamps(key, window_start, now).await?;
        if count >= i64::from(self.limit) {
            debug!(key, count, limit = self.limit, "sliding window limit exceeded");
            return Ok(false);
        }

        self.store.add_timestamp(key, now, self.window).await?;
        Ok(true)
    }

    /// Stop the background mutex cleanup task. Subsequent calls are no-ops.
    pub fn stop_cleanup(&self) {
        self.mutexes.stop_cleanup();
    }
}

#[async_trait]
impl<S: Store> RateLimiter for SlidingWindowLimiter<S> {
    async fn allow(&self, key: &str) -> Result<bool> {
        SlidingWindowLimiter::allow(self, key).await
    }
}
