//! Backoff computation for retried API calls.
//!
//! Server hints win: a parseable `Retry-After` header (delta-seconds or
//! HTTP-date) takes priority over any computed backoff. Without a hint the
//! policy applies full jitter over an exponential ceiling, per the usual
//! "pick uniformly in [0, min(cap, base * 2^attempt)]" scheme.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ApiError;

/// Configuration for retry/backoff behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum attempts per logical call (first try included).
    pub max_attempts: u32,
    /// Base delay for the exponential ceiling.
    pub base_delay: Duration,
    /// Hard cap on any computed delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }
}

/// Computes delays between retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Compute the delay before the next attempt.
    ///
    /// `attempt` is zero-based (0 = delay after the first failure). When
    /// `retry_after` parses, its value is honored verbatim (clamped to a
    /// one-second minimum to absorb clock skew) regardless of `attempt`.
    pub fn compute_delay(
        &self,
        attempt: u32,
        retry_after: Option<&str>,
        now: DateTime<Utc>,
    ) -> Duration {
        if let Some(hint) = retry_after.and_then(|raw| parse_retry_after(raw, now)) {
            return hint;
        }

        let ceiling = self.backoff_ceiling(attempt);
        // Full jitter: uniform in [0, ceiling].
        ceiling.mul_f64(fastrand::f64())
    }

    /// The exponential ceiling for a given attempt, capped at `max_delay`.
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_delay.as_millis() as u64;
        let shift = attempt.min(20);
        let exponential_ms = base_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(exponential_ms).min(self.config.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` tries.
    pub fn should_retry(&self, error: &ApiError, attempts: u32) -> bool {
        error.is_transient() && attempts < self.config.max_attempts
    }
}

/// Parse a `Retry-After` header value relative to `now`.
///
/// Accepts delta-seconds (`"120"`) or an HTTP-date. A delay that lands in
/// the past, or a negative delta, clamps to one second rather than zero so a
/// skewed server clock never turns into a hot retry loop. Unparseable input
/// yields `None` and the caller falls back to computed backoff.
pub fn parse_retry_after(raw: &str, now: DateTime<Utc>) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(secs) = raw.parse::<i64>() {
        let clamped = secs.max(1) as u64;
        return Some(Duration::from_secs(clamped));
    }

    if let Ok(date) = DateTime::parse_from_rfc2822(raw) {
        let delta = date.with_timezone(&Utc) - now;
        let secs = delta.num_seconds().max(1) as u64;
        return Some(Duration::from_secs(secs));
    }

    None
}
