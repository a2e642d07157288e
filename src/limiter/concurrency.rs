//! Bounded concurrency limiting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::key::validate_key;
use super::mutex::KeyMutexTable;
use super::RateLimiter;
use crate::error::{Error, Result};
use crate::store::Store;

/// Safety-net TTL on the slot counter: long enough not to interfere
/// with normal traffic, short enough that slots leaked by callers that
/// never release self-heal.
const SLOT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Limits the number of in-flight requests per key.
///
/// Each successful [`allow`](ConcurrencyLimiter::allow) must be paired
/// with a [`release`](ConcurrencyLimiter::release) once the request
/// finishes. Excess releases are masked: the store clamps the counter
/// at zero.
pub struct ConcurrencyLimiter<S> {
    store: Arc<S>,
    max_concurrent: u32,
    mutexes: KeyMutexTable,
}

impl<S: Store> ConcurrencyLimiter<S> {
    /// Create a new limiter allowing `max_concurrent` in-flight requests
    /// per key.
    pub fn new(store: Arc<S>, max_concurrent: u32) -> Result<Self> {
        if max_concurrent == 0 {
            return Err(Error::Config(
                "max concurrent must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            store,
            max_concurrent,
            mutexes: KeyMutexTable::new(),
        })
    }

    /// Try to acquire an in-flight slot for `key`.
    pub async fn allow(&self, key: &str) -> Result<bool> {
        validate_key(key)?;

        let _guard = self.mutexes.lock(key).await;
        let count = self.store.increment(key, 1, SLOT_TTL).await?;
        if count <= i64::from(self.max_concurrent) {
            return Ok(true);
        }

        // Over the limit: undo the optimistic increment.
        self.store.increment(key, -1, SLOT_TTL).await?;
        debug!(key, count, max = self.max_concurrent, "concurrency limit reached");
        Ok(false)
    }

    /// Release a slot previously acquired for `key`.
    pub async fn release(&self, key: &str) -> Result<()> {
        validate_key(key)?;

        let _guard = self.mutexes.lock(key).await;
        self.store.increment(key, -1, SLOT_TTL).await?;
        Ok(())
    }

    /// Stop the background mutex cleanup task. Subsequent calls are no-ops.
    pub fn stop_cleanup(&self) {
        self.mutexes.stop_cleanup();
    }
}

#[async_trait]
impl<S: Store> RateLimiter for ConcurrencyLimiter<S> {
    async fn allow(&self, key: &str) -> Result<bool> {
        ConcurrencyLimiter::allow(self, key).await
    }
}
