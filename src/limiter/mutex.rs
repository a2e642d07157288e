//! Per-key mutual exclusion with idle reaping.
//!
//! Algorithms that do a read-modify-write on opaque state serialise
//! their decisions per key through this table instead of one global
//! lock per limiter. Entries are created lazily and reaped by a
//! background task once idle.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tokio::time::MissedTickBehavior;
use tracing::trace;

/// How often the cleanup task scans for idle entries. Entries idle for
/// more than twice this interval are removed.
pub(crate) const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

struct KeyEntry {
    lock: Arc<Mutex<()>>,
    last_access_ms: AtomicI64,
}

/// A lazily-populated map from key to mutex.
///
/// The cleanup task holds a weak reference to the map, so it exits when
/// the owning limiter is dropped; [`KeyMutexTable::stop_cleanup`] stops
/// it explicitly.
pub(crate) struct KeyMutexTable {
    entries: Arc<DashMap<String, Arc<KeyEntry>>>,
    stop_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
}

impl KeyMutexTable {
    pub(crate) fn new() -> Self {
        Self::with_cleanup_interval(DEFAULT_CLEANUP_INTERVAL)
    }

    pub(crate) fn with_cleanup_interval(interval: Duration) -> Self {
        let entries = Arc::new(DashMap::new());
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(cleanup_task(Arc::downgrade(&entries), interval, stop_rx));
        Self {
            entries,
            stop_tx: parking_lot::Mutex::new(Some(stop_tx)),
        }
    }

    /// Lock the mutex for `key`, creating an entry on first use.
    /// The guard is held for the duration of a single decision.
    pub(crate) async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(KeyEntry {
                    lock: Arc::new(Mutex::new(())),
                    last_access_ms: AtomicI64::new(now_millis()),
                })
            })
            .clone();
        entry.last_access_ms.store(now_millis(), Ordering::Relaxed);
        entry.lock.clone().lock_owned().await
    }

    /// Stop the cleanup task. Subsequent calls are no-ops.
    pub(crate) fn stop_cleanup(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

async fn cleanup_task(
    entries: Weak<DashMap<String, Arc<KeyEntry>>>,
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
                let Some(entries) = entries.upgrade() else { return };
                reap_idle(&entries, interval);
            }
            _ = &mut stop_rx => return,
        }
    }
}

fn reap_idle(entries: &DashMap<String, Arc<KeyEntry>>, interval: Duration) {
    let cutoff = now_millis() - 2 * interval.as_millis() as i64;
    let before = entries.len();
    entries.retain(|_, entry| {
        if entry.last_access_ms.load(Ordering::Relaxed) >= cutoff {
            return true;
        }
        // try_lock guards against evicting a mutex held by an
        // in-flight decision.
        entry.lock.try_lock().is_err()
    });
    let removed = before.saturating_sub(entries.len());
    if removed > 0 {
        trace!(removed, "reaped idle key mutexes");
    }
}
