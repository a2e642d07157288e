//! Rate limiting algorithms and the policy factory.

mod concurrency;
mod fixed_window;
mod key;
mod leaky_bucket;
mod mutex;
mod sliding_window;
mod token_bucket;

pub use concurrency::ConcurrencyLimiter;
pub use fixed_window::FixedWindowLimiter;
pub use leaky_bucket::LeakyBucketLimiter;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::Store;

/// Current time as nanoseconds since the Unix epoch.
///
/// Wall-clock based so that state shared through a remote store is
/// comparable across replicas.
pub(crate) fn now_unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// The uniform decision interface implemented by every limiter.
///
/// `Ok(true)` means the caller may proceed; `Ok(false)` means the
/// request is rate-limited and must be rejected; `Err(_)` means the key
/// was invalid or the backend is unhealthy, and the caller should fail
/// closed.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Check whether a request associated with `key` may proceed.
    async fn allow(&self, key: &str) -> Result<bool>;
}

/// Tagged configuration from which [`Limiter::build`] constructs a
/// limiter.
///
/// Serialized form uses a `policy` tag, e.g.:
///
/// ```yaml
/// policy: token_bucket
/// capacity: 100.0
/// refill_rate: 10.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PolicyConfig {
    /// Counter per fixed time window.
    FixedWindow { limit: u32, window: Duration },
    /// Timestamp set over a window sliding with each request.
    SlidingWindow { limit: u32, window: Duration },
    /// Burst capacity with continuous refill.
    TokenBucket { capacity: f64, refill_rate: f64 },
    /// Bounded queue draining one slot per interval.
    LeakyBucket { capacity: u32, leak_interval: Duration },
    /// Bounded in-flight requests with paired allow/release.
    Concurrency { max_concurrent: u32 },
}

impl PolicyConfig {
    /// Parse a policy configuration from YAML. Unknown policy tags are
    /// rejected.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("failed to parse policy config: {e}")))
    }
}

/// A limiter constructed by [`Limiter::build`], dispatching to one of
/// the five algorithms.
pub enum Limiter<S> {
    FixedWindow(FixedWindowLimiter<S>),
    SlidingWindow(SlidingWindowLimiter<S>),
    TokenBucket(TokenBucketLimiter<S>),
    LeakyBucket(LeakyBucketLimiter<S>),
    Concurrency(ConcurrencyLimiter<S>),
}

impl<S: Store> Limiter<S> {
    /// Construct a limiter over `store` from a tagged policy
    /// configuration. Performs no I/O; parameter validation failures
    /// surface as [`Error::Config`].
    pub fn build(store: Arc<S>, config: PolicyConfig) -> Result<Self> {
        match config {
            PolicyConfig::FixedWindow { limit, window } => Ok(Self::FixedWindow(
                FixedWindowLimiter::new(store, limit, window)?,
            )),
            PolicyConfig::SlidingWindow { limit, window } => Ok(Self::SlidingWindow(
                SlidingWindowLimiter::new(store, limit, window)?,
            )),
            PolicyConfig::TokenBucket {
                capacity,
                refill_rate,
            } => Ok(Self::TokenBucket(TokenBucketLimiter::new(
                store,
                capacity,
                refill_rate,
            )?)),
            PolicyConfig::LeakyBucket {
                capacity,
                leak_interval,
            } => Ok(Self::LeakyBucket(LeakyBucketLimiter::new(
                store,
                capacity,
                leak_interval,
            )?)),
            PolicyConfig::Concurrency { max_concurrent } => Ok(Self::Concurrency(
                ConcurrencyLimiter::new(store, max_concurrent)?,
            )),
        }
    }

    /// Check whether a request associated with `key` may proceed.
    pub async fn allow(&self, key: &str) -> Result<bool> {
        match self {
            Self::FixedWindow(l) => l.allow(key).await,
            Self::SlidingWindow(l) => l.allow(key).await,
            Self::TokenBucket(l) => l.allow(key).await,
            Self::LeakyBucket(l) => l.allow(key).await,
            Self::Concurrency(l) => l.allow(key).await,
        }
    }

    /// Release an in-flight slot previously acquired through a
    /// concurrency limiter. Other policies have nothing to release.
    pub async fn release(&self, key: &str) -> Result<()> {
        match self {
            Self::Concurrency(l) => l.release(key).await,
            _ => Err(Error::Config(format!(
                "policy {} does not support release",
                self.policy()
            ))),
        }
    }

    /// Name of the active policy, matching the configuration tag.
    pub fn policy(&self) -> &'static str {
        match self {
            Self::FixedWindow(_) => "fixed_window",
            Self::SlidingWindow(_) => "sliding_window",
            Self::TokenBucket(_) => "token_bucket",
            Self::LeakyBucket(_) => "leaky_bucket",
            Self::Concurrency(_) => "concurrency",
        }
    }

    /// Stop the background mutex cleanup task for policies that keep
    /// one. Subsequent calls are no-ops.
    pub fn stop_cleanup(&self) {
        match self {
            Self::FixedWindow(_) => {}
            Self::SlidingWindow(l) => l.stop_cleanup(),
            Self::TokenBucket(l) => l.stop_cleanup(),
            Self::LeakyBucket(l) => l.stop_cleanup(),
            Self::Concurrency(l) => l.stop_cleanup(),
        }
    }
}

#[async_trait]
impl<S: Store> RateLimiter for Limiter<S> {
    async fn allow(&self, key: &str) -> Result<bool> {
        Limiter::allow(self, key).await
    }
}
