//! Token bucket rate limiting for outbound API calls.
//!
//! The bucket refills lazily on each acquisition attempt, so there is no
//! background timer and no I/O inside the critical section.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Configuration for the token bucket.
///
/// The defaults (35 tokens capacity, 35 tokens/sec refill) sit comfortably
/// below an assumed upstream ceiling of ~50 requests per second.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Sustained refill rate in tokens per second.
    pub rate_base: f64,
    /// Maximum tokens the bucket can hold (burst capacity).
    pub capacity: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate_base: 35.0,
            capacity: 35.0,
        }
    }
}

impl RateLimitConfig {
    pub fn with_rate_base(mut self, rate: f64) -> Self {
        self.rate_base = rate;
        self
    }

    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = capacity;
        self
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter.
///
/// Acquisition never blocks: on refusal the caller receives the shortfall
/// duration from [`TokenBucket::time_until_available`] and decides how to
/// wait. One mutex guards the whole acquire path.
#[derive(Debug)]
pub struct TokenBucket {
    config: RateLimitConfig,
    state: Mutex<BucketState>,
    total_requests: AtomicU64,
    total_rejected: AtomicU64,
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
            total_requests: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }

    /// Refill based on elapsed time. Must be called with the lock held.
    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        state.tokens = (state.tokens + elapsed * self.config.rate_base).min(self.config.capacity);
    }

    /// Try to acquire `n` tokens without waiting.
    pub fn try_acquire(&self, n: f64) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.refill(&mut state, Instant::now());
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// How long until `n` tokens will be available at the sustained rate.
    ///
    /// Returns zero when the tokens are already there. The estimate is only
    /// advisory under contention; callers re-acquire after waiting.
    pub fn time_until_available(&self, n: f64) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.refill(&mut state, Instant::now());
        if state.tokens >= n {
            return Duration::ZERO;
        }
        let shortfall = n - state.tokens;
        if self.config.rate_base <= 0.0 {
            return Duration::from_secs(1);
        }
        Duration::from_secs_f64(shortfall / self.config.rate_base)
    }

    /// Snapshot of acquisition statistics.
    pub fn stats(&self) -> RateLimitStats {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        RateLimitStats {
            available_tokens: state.tokens,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Statistics snapshot for a token bucket.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitStats {
    pub available_tokens: f64,
    pub total_requests: u64,
    pub total_rejected: u64,
}

impl RateLimitStats {
    /// Fraction of acquisition attempts that were refused.
    pub fn rejection_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_rejected as f64 / self.total_requests as f64
        }
    }
}
