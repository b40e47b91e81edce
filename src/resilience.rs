//! Resilience utilities: retry policies, rate limiting, bulkheads.
//!
//! - [`RetryConfig`]: Exponential backoff for registry calls from a node
//! - [`BackoffPolicy`]: Strategy for version-conflict retries in the registry
//! - [`RateLimiter`]: Token bucket used to throttle served reads
//! - [`Bulkhead`]: Semaphore bounding concurrent upstream health probes
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), pipe_replication::resilience::BulkheadFull> {
//! use pipe_replication::resilience::{BackoffPolicy, Bulkhead, JitteredBackoff};
//! use std::time::Duration;
//!
//! // 500ms + uniform(0, 500ms), at most 10 attempts
//! let backoff = JitteredBackoff::new(10, Duration::from_millis(500), Duration::from_millis(500));
//! tokio::time::sleep(backoff.delay(1)).await;
//!
//! // Bulkhead: max 8 concurrent probes
//! let bulkhead = Bulkhead::new(8);
//! let _permit = bulkhead.acquire().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::CasConfig;
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Configuration for retrying a call with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first call included.
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Retry policy for one registration round.
    ///
    /// A few quick attempts; the periodic registration timer is the outer
    /// retry loop, so giving up early costs at most one interval.
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        500ms
    /// 2        750ms
    /// 3        (give up until next tick)
    /// ```
    pub fn registration() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_factor: 1.5,
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let delay = Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()));

        std::cmp::min(delay, self.max_delay)
    }
}

// =============================================================================
// Conflict Backoff
// =============================================================================

/// Retry strategy for optimistic concurrency conflicts.
///
/// Kept behind a trait so the registration loop never sleeps inline on its
/// own arithmetic and tests can swap in [`FixedBackoff::zero()`].
pub trait BackoffPolicy: Send + Sync {
    /// Total attempts before giving up (first try included).
    fn max_attempts(&self) -> usize;

    /// Delay to wait after failed attempt `attempt` (1-indexed).
    fn delay(&self, attempt: usize) -> Duration;
}

/// `base_delay + uniform(0, jitter)` on every attempt.
///
/// Jitter spreads registry instances that collided on the same row so the
/// next round does not collide again.
#[derive(Debug, Clone)]
pub struct JitteredBackoff {
    max_attempts: usize,
    base_delay: Duration,
    jitter: Duration,
}

impl JitteredBackoff {
    pub fn new(max_attempts: usize, base_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            jitter,
        }
    }

    pub fn from_config(config: &CasConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.base_delay_duration(),
            config.jitter_duration(),
        )
    }
}

impl Default for JitteredBackoff {
    fn default() -> Self {
        Self::from_config(&CasConfig::default())
    }
}

impl BackoffPolicy for JitteredBackoff {
    fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn delay(&self, _attempt: usize) -> Duration {
        let spread = self.jitter.as_secs_f64() * rand::random::<f64>();
        self.base_delay + Duration::from_secs_f64(spread)
    }
}

/// Constant delay, deterministic.
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    max_attempts: usize,
    delay: Duration,
}

impl FixedBackoff {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// No waiting at all, for tests.
    pub fn zero(max_attempts: usize) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }
}

impl BackoffPolicy for FixedBackoff {
    fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn delay(&self, _attempt: usize) -> Duration {
        self.delay
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Uses a token bucket algorithm: tokens refill at `refill_rate` per second,
/// up to `burst_size` tokens. Each operation consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 10 reads/sec, no extra burst.
    fn default() -> Self {
        Self {
            burst_size: 10,
            refill_rate: 10,
        }
    }
}

/// Token bucket rate limiter.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
        }
    }

    /// Try to acquire a permit without blocking.
    ///
    /// Returns `true` if acquired, `false` if rate limit exceeded.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when bulkhead is full.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    /// Maximum concurrent operations allowed.
    pub max_concurrent: usize,
}

/// Limits concurrent operations with a semaphore.
///
/// A node probes every URL of its follow chain on each health tick; the
/// bulkhead keeps a long chain from opening a burst of connections.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit.
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary.
    ///
    /// Returns a permit that releases the slot when dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }
}
