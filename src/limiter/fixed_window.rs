//! Fixed window rate limiting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::key::validate_key;
use super::{now_unix_nanos, RateLimiter};
use crate::error::{Error, Result};
use crate::store::Store;

/// Limits the number of requests allowed within a fixed time window.
/// Once the limit is reached, all subsequent requests are denied until
/// the window rolls over.
///
/// Keying the counter on the window number avoids a read-modify-write
/// and exploits the store's atomic increment, so no per-key mutex is
/// needed. The trade is the well-known burst at the boundary: up to
/// twice the limit can pass within two adjacent windows.
pub struct FixedWindowLimiter<S> {
    store: Arc<S>,
    limit: u32,
    window: Duration,
}

impl<S: Store> FixedWindowLimiter<S> {
    /// Create a new limiter allowing `limit` requests per `window`.
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
        })
    }

    /// Check whether a request for `key` is allowed under the limit.
    pub async fn allow(&self, key: &str) -> Result<bool> {
        validate_key(key)?;

        let window_key = self.window_key(key);
        // The TTL equals the window, so the counter key disposes of
        // itself once the window has passed.
        let count = self.store.increment(&window_key, 1, self.window).await?;

        let allowed = count <= i64::from(self.limit);
        if !allowed {
            debug!(key, count, limit = self.limit, "fixed window limit exceeded");
        }
        Ok(allowed)
    }

    /// Combine the client key with the current window number, so counts
    /// are tracked separately per client and per window.
    fn window_key(&self, key: &str) -> String {
        let window_number = now_unix_nanos() / self.window.as_nanos() as i64;
        format!("{key}:{window_number}")
    }
}

#[async_trait]
impl<S: Store> RateLimiter for FixedWindowLimiter<S> {
    async fn allow(&self, key: &str) -> Result<bool> {
        FixedWindowLimiter::allow(self, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_allows_up_to_limit_then_denies() {
        let store = Arc::new(MemoryStore::new());
        let limiter = FixedWindowLimiter::new(store, 5, Duration::from_secs(60)).unwrap();

        for i in 0..5 {
            assert!(
                limiter.allow("user1").await.unwrap(),
                "request {} should be allowed",
                i + 1
            );
        }
        assert!(!limiter.allow("user1").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_are_limited_independently() {
        let store = Arc::new(MemoryStore::new());
        let limiter = FixedWindowLimiter::new(store, 1, Duration::from_secs(60)).unwrap();

        assert!(limiter.allow("user1").await.unwrap());
        assert!(!limiter.allow("user1").await.unwrap());
        assert!(limiter.allow("user2").await.unwrap());
    }

    #[tokio::test]
    async fn test_fresh_counter_after_window_rolls_over() {
        let store = Arc::new(MemoryStore::new());
        let limiter = FixedWindowLimiter::new(store, 1, Duration::from_millis(100)).unwrap();

        assert!(limiter.allow("user1").await.unwrap());
        assert!(!limiter.allow("user1").await.unwrap());

        // Crossing the boundary lands in the next window's counter.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.allow("user1").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_key_touches_no_state() {
        let store = Arc::new(MemoryStore::new());
        let limiter =
            FixedWindowLimiter::new(store.clone(), 5, Duration::from_secs(60)).unwrap();

        let result = limiter.allow("bad!key").await;
        assert!(matches!(result, Err(Error::InvalidKey(_))));

        let window_key = limiter.window_key("bad!key");
        assert_eq!(store.get_counter(&window_key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rejects_zero_parameters() {
        let store = Arc::new(MemoryStore::new());
        assert!(matches!(
            FixedWindowLimiter::new(store.clone(), 0, Duration::from_secs(1)),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            FixedWindowLimiter::new(store, 5, Duration::ZERO),
            Err(Error::Config(_))
        ));
    }
}
