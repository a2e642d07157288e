//! In-process storage backend.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::trace;

use super::{LeakyBucketState, Store, TokenBucketState};
use crate::error::Result;

/// How often the background sweep deletes expired entries.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// A stored value with its expiry instant.
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// All state maps, guarded together by one coarse mutex.
#[derive(Default)]
struct Maps {
    counters: HashMap<String, Expiring<i64>>,
    timestamps: HashMap<String, Expiring<Vec<i64>>>,
    token_buckets: HashMap<String, Expiring<TokenBucketState>>,
    leaky_buckets: HashMap<String, Expiring<LeakyBucketState>>,
}

impl Maps {
    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.counters.len()
            + self.timestamps.len()
            + self.token_buckets.len()
            + self.leaky_buckets.len();
        self.counters.retain(|_, e| !e.is_expired(now));
        self.timestamps.retain(|_, e| !e.is_expired(now));
        self.token_buckets.retain(|_, e| !e.is_expired(now));
        self.leaky_buckets.retain(|_, e| !e.is_expired(now));
        before
            - (self.counters.len()
                + self.timestamps.len()
                + self.token_buckets.len()
                + self.leaky_buckets.len())
    }
}

/// An in-process implementation of the [`Store`] trait.
///
/// Correctness does not depend on sweep latency: every read treats an
/// expired entry as absent. The sweep only reclaims memory. The sweep
/// task holds a weak reference, so it exits when the store is dropped.
///
/// Must be constructed inside a tokio runtime.
pub struct MemoryStore {
    maps: Arc<Mutex<Maps>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl MemoryStore {
    /// Create a new store with the default sweep interval (5 minutes).
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a new store sweeping expired entries every `interval`.
    pub fn with_sweep_interval(interval: Duration) -> Self {
        let maps = Arc::new(Mutex::new(Maps::default()));
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(sweep_task(Arc::downgrade(&maps), interval, stop_rx));
        Self {
            maps,
            stop_tx: Mutex::new(Some(stop_tx)),
        }
    }

    /// Stop the background sweep task. Subsequent calls are no-ops.
    pub fn stop_sweeper(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

async fn sweep_task(
    maps: Weak<Mutex<Maps>>,
    interval: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(maps) = maps.upgrade() else { return };
                let removed = maps.lock().sweep(Instant::now());
                if removed > 0 {
                    trace!(removed, "swept expired store entries");
                }
            }
            _ = &mut stop_rx => return,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let now = Instant::now();
        let mut maps = self.maps.lock();
        let entry = maps
            .counters
            .entry(key.to_string())
            .or_insert_with(|| Expiring {
                value: 0,
                expires_at: now + ttl,
            });
        if entry.is_expired(now) {
            // Re-created after expiry: fresh count, fresh TTL.
            entry.value = delta.max(0);
            entry.expires_at = now + ttl;
        } else {
            // The TTL is deliberately not refreshed here.
            entry.value = (entry.value + delta).max(0);
        }
        Ok(entry.value)
    }

    async fn get_counter(&self, key: &str) -> Result<i64> {
        let now = Instant::now();
        let maps = self.maps.lock();
        Ok(maps
            .counters
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value)
            .unwrap_or(0))
    }

    async fn add_timestamp(&self, key: &str, timestamp_ns: i64, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut maps = self.maps.lock();
        let entry = maps
            .timestamps
            .entry(key.to_string())
            .or_insert_with(|| Expiring {
                value: Vec::new(),
                expires_at: now + ttl,
            });
        if entry.is_expired(now) {
            entry.value.clear();
        }
        entry.value.push(timestamp_ns);
        entry.expires_at = now + ttl;
        Ok(())
    }

    async fn count_timestamps(&self, key: &str, start_ns: i64, end_ns: i64) -> Result<i64> {
        let now = Instant::now();
        let mut maps = self.maps.lock();
        if maps.timestamps.get(key).is_some_and(|e| e.is_expired(now)) {
            maps.timestamps.remove(key);
            return Ok(0);
        }
        let Some(entry) = maps.timestamps.get_mut(key) else {
            return Ok(0);
        };
        // Trimming here is what bounds memory per key.
        entry.value.retain(|&ts| ts >= start_ns);
        Ok(entry.value.iter().filter(|&&ts| ts <= end_ns).count() as i64)
    }

    async fn get_token_bucket(&self, key: &str) -> Result<Option<TokenBucketState>> {
        let now = Instant::now();
        let maps = self.maps.lock();
        Ok(maps
            .token_buckets
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value))
    }

    async fn set_token_bucket(
        &self,
        key: &str,
        state: TokenBucketState,
        ttl: Duration,
    ) -> Result<()> {
        let now = Instant::now();
        let mut maps = self.maps.lock();
        maps.token_buckets.insert(
            key.to_string(),
            Expiring {
                value: state,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn get_leaky_bucket(&self, key: &str) -> Result<Option<LeakyBucketState>> {
        let now = Instant::now();
        let maps = self.maps.lock();
        Ok(maps
            .leaky_buckets
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value))
    }

    async fn set_leaky_bucket(
        &self,
        key: &str,
        state: LeakyBucketState,
        ttl: Duration,
    ) -> Result<()> {
        let now = Instant::now();
        let mut maps = self.maps.lock();
        maps.leaky_buckets.insert(
            key.to_string(),
            Expiring {
                value: state,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_increment_creates_and_counts() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(store.increment("k", 1, ttl).await.unwrap(), 1);
        assert_eq!(store.increment("k", 1, ttl).await.unwrap(), 2);
        assert_eq!(store.get_counter("k").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_increment_clamps_at_zero() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        store.increment("k", 1, ttl).await.unwrap();
        assert_eq!(store.increment("k", -5, ttl).await.unwrap(), 0);
        // A decrement on an absent key creates a zeroed counter.
        assert_eq!(store.increment("fresh", -1, ttl).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_counter_reads_as_absent() {
        let store = MemoryStore::new();
        let ttl = Duration::from_millis(30);

        store.increment("k", 5, ttl).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.get_counter("k").await.unwrap(), 0);
        // Re-creation after expiry starts a fresh counter with a fresh TTL.
        assert_eq!(store.increment("k", 1, ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_count_timestamps_trims_old_entries() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        store.add_timestamp("k", 100, ttl).await.unwrap();
        store.add_timestamp("k", 200, ttl).await.unwrap();
        store.add_timestamp("k", 300, ttl).await.unwrap();

        assert_eq!(store.count_timestamps("k", 150, 300).await.unwrap(), 2);
        // The first call removed the timestamp below 150.
        assert_eq!(store.count_timestamps("k", 0, 300).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_bucket_state_expires() {
        let store = MemoryStore::new();
        let state = TokenBucketState {
            tokens: 2.5,
            last_update_ns: 42,
        };

        store
            .set_token_bucket("k", state, Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(store.get_token_bucket("k").await.unwrap(), Some(state));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get_token_bucket("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_entries() {
        let store = MemoryStore::with_sweep_interval(Duration::from_millis(20));
        store
            .increment("k", 1, Duration::from_millis(10))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(store.maps.lock().counters.is_empty());
        store.stop_sweeper();
        store.stop_sweeper();
    }
}
