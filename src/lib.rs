//! keygate - per-key request rate limiting.
//!
//! This crate gates request flow against per-identity quotas. For each
//! logical client (an API token, user id, IP address) and each
//! configured policy it decides whether the current request may
//! proceed. Five algorithms are available - fixed window, sliding
//! window, token bucket, leaky bucket, and bounded concurrency - over a
//! pluggable [`Store`] backend: an in-process [`MemoryStore`], or a
//! [`RedisStore`] shared by multiple service replicas.
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use keygate::{FixedWindowLimiter, MemoryStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> keygate::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let limiter = FixedWindowLimiter::new(store, 100, Duration::from_secs(60))?;
//!
//! if limiter.allow("client-42").await? {
//!     // handle the request
//! } else {
//!     // reject, e.g. with HTTP 429
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Limiters can also be built from a tagged [`PolicyConfig`] through
//! [`Limiter::build`]. Callers should fail closed: any error from
//! `allow` means the request must be denied.

pub mod error;
pub mod limiter;
pub mod store;

pub use error::{Error, Result};
pub use limiter::{
    ConcurrencyLimiter, FixedWindowLimiter, LeakyBucketLimiter, Limiter, PolicyConfig,
    RateLimiter, SlidingWindowLimiter, TokenBucketLimiter,
};
pub use store::{LeakyBucketState, MemoryStore, RedisStore, Store, TokenBucketState};
