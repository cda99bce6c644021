//! The rate-limiter state machine governing every outbound API call.
//!
//! Five states: `Normal`, `Throttle`, `Sleep`, `HalfOpen`, `CacheOnly`.
//! Callers ask [`RateLimiter::before_call`] for a [`Decision`], issue the
//! call (if told to proceed), and report the result through
//! [`RateLimiter::after_call`], where all transitions are evaluated. One
//! mutex guards state, both error windows, and the token bucket; no network
//! I/O ever happens under it.
//!
//! Transitions that depend on the error rate require the qualifying rate on
//! two consecutive evaluations (hysteresis) so a single noisy sample cannot
//! flip the state.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::rate_limit::{RateLimitConfig, RateLimitStats, TokenBucket};
use super::window::{CallOutcome, ErrorWindow};

/// Operating state of the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterState {
    /// Calls flow freely, gated only by the token bucket.
    Normal,
    /// Elevated error rate; still calling, watching for recovery or collapse.
    Throttle,
    /// Circuit open: no calls until the cooldown elapses.
    Sleep,
    /// Cautiously probing; a run of successes closes the circuit.
    HalfOpen,
    /// Serving cached data only, with periodic recovery probes.
    CacheOnly,
}

/// What the caller should do with the next API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Issue the call now.
    Proceed,
    /// Wait this long, then ask again. Does not count as a failed attempt.
    Wait(Duration),
    /// Skip the network entirely; serve from cache or report no data.
    UseCacheOnly,
}

/// Thresholds and timings for the state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LimiterConfig {
    /// Short-window error rate above which `Normal` degrades to `Throttle`.
    pub p_throttle: f64,
    /// Short-window error rate below which `Throttle` recovers to `Normal`.
    pub p_recover: f64,
    /// Long-window error rate at which `Throttle` collapses to `Sleep`.
    pub p_sleep: f64,
    /// Consecutive 429s at which `Throttle` collapses to `Sleep`.
    pub n_throttle: u32,
    /// Consecutive failures (with the circuit already open past
    /// `cacheonly_after`) that divert to `CacheOnly`.
    pub n_cacheonly: u32,
    /// Consecutive qualifying evaluations required before a rate-driven
    /// transition fires.
    pub hysteresis: u32,
    /// Initial sleep cooldown.
    pub sleep_min: Duration,
    /// Ceiling for the escalated cooldown.
    pub sleep_max: Duration,
    /// Cooldown multiplier applied when a half-open probe fails.
    pub cooldown_factor: f64,
    /// Consecutive successful probes required to close the circuit.
    pub half_open_probes: u32,
    /// Interval between recovery probes while in `CacheOnly`.
    pub probe_interval: Duration,
    /// How long the circuit must have been open before `CacheOnly` is
    /// considered.
    pub cacheonly_after: Duration,
    /// Span of the short (throttling) outcome window.
    pub short_window: Duration,
    /// Span of the long (collapse) outcome window.
    pub long_window: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            p_throttle: 0.20,
            p_recover: 0.10,
            p_sleep: 0.60,
            n_throttle: 3,
            n_cacheonly: 8,
            hysteresis: 2,
            sleep_min: Duration::from_secs(5),
            sleep_max: Duration::from_secs(120),
            cooldown_factor: 2.0,
            half_open_probes: 5,
            probe_interval: Duration::from_secs(60),
            cacheonly_after: Duration::from_secs(180),
            short_window: Duration::from_secs(30),
            long_window: Duration::from_secs(300),
        }
    }
}

impl LimiterConfig {
    pub fn with_sleep_min(mut self, d: Duration) -> Self {
        self.sleep_min = d;
        self
    }

    pub fn with_sleep_max(mut self, d: Duration) -> Self {
        self.sleep_max = d;
        self
    }

    pub fn with_probe_interval(mut self, d: Duration) -> Self {
        self.probe_interval = d;
        self
    }
}

struct Inner {
    state: LimiterState,
    bucket: TokenBucket,
    short: ErrorWindow,
    long: ErrorWindow,
    throttle_streak: u32,
    recover_streak: u32,
    consecutive_rate_limited: u32,
    consecutive_failures: u32,
    probe_successes: u32,
    current_cooldown: Duration,
    sleep_until: Option<Instant>,
    open_since: Option<Instant>,
    last_probe: Option<Instant>,
}

/// The rate-limiter state machine.
///
/// Construct once and share by `Arc`; there is no process-global instance.
pub struct RateLimiter {
    config: LimiterConfig,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig, bucket_config: RateLimitConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: LimiterState::Normal,
                bucket: TokenBucket::new(bucket_config),
                short: ErrorWindow::new(config.short_window),
                long: ErrorWindow::new(config.long_window),
                throttle_streak: 0,
                recover_streak: 0,
                consecutive_rate_limited: 0,
                consecutive_failures: 0,
                probe_successes: 0,
                current_cooldown: config.sleep_min,
                sleep_until: None,
                open_since: None,
                last_probe: None,
            }),
            config,
        }
    }

    /// Decide whether the next call may proceed.
    pub fn before_call(&self) -> Decision {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();

        // Time-driven wakeup: the sleep timer elapsing moves to HalfOpen.
        if inner.state == LimiterState::Sleep {
            match inner.sleep_until {
                Some(until) if now < until => return Decision::Wait(until - now),
                _ => {
                    Self::transition(&mut inner, LimiterState::HalfOpen);
                    inner.probe_successes = 0;
                }
            }
        }

        match inner.state {
            LimiterState::Normal | LimiterState::Throttle | LimiterState::HalfOpen => {
                if inner.bucket.try_acquire(1.0) {
                    Decision::Proceed
                } else {
                    let wait = inner
                        .bucket
                        .time_until_available(1.0)
                        .max(Duration::from_millis(10));
                    debug!(state = ?inner.state, ?wait, "token bucket empty; deferring call");
                    Decision::Wait(wait)
                }
            }
            LimiterState::CacheOnly => {
                let due = match inner.last_probe {
                    None => true,
                    Some(at) => now.duration_since(at) >= self.config.probe_interval,
                };
                if due {
                    inner.last_probe = Some(now);
                    debug!("cache-only recovery probe due; allowing one call");
                    Decision::Proceed
                } else {
                    Decision::UseCacheOnly
                }
            }
            // Handled above; unreachable without a timer but kept total.
            LimiterState::Sleep => Decision::Wait(inner.current_cooldown),
        }
    }

    /// Record a completed call and evaluate transitions.
    pub fn after_call(&self, outcome: CallOutcome) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();

        inner.short.record(now, outcome);
        inner.long.record(now, outcome);

        if outcome == CallOutcome::RateLimited {
            inner.consecutive_rate_limited += 1;
        } else {
            inner.consecutive_rate_limited = 0;
        }
        if outcome.is_error() {
            inner.consecutive_failures += 1;
        } else {
            inner.consecutive_failures = 0;
        }

        self.evaluate(&mut inner, outcome, now);
    }

    fn evaluate(&self, inner: &mut Inner, outcome: CallOutcome, now: Instant) {
        let cfg = &self.config;

        // Prolonged open circuit with the API still failing diverts to
        // cache-only, regardless of the current state.
        if inner.state != LimiterState::CacheOnly {
            if let Some(open_since) = inner.open_since {
                if now.duration_since(open_since) > cfg.cacheonly_after
                    && inner.consecutive_failures >= cfg.n_cacheonly
                    && outcome.is_error()
                {
                    warn!(
                        open_for = ?now.duration_since(open_since),
                        failures = inner.consecutive_failures,
                        "API still failing with circuit open; diverting to cache-only"
                    );
                    Self::transition(inner, LimiterState::CacheOnly);
                    inner.last_probe = Some(now);
                    return;
                }
            }
        }

        match inner.state {
            LimiterState::Normal => {
                let rate = inner.short.error_rate(now);
                if rate > cfg.p_throttle {
                    inner.throttle_streak += 1;
                } else {
                    inner.throttle_streak = 0;
                }
                if inner.throttle_streak >= cfg.hysteresis {
                    Self::transition(inner, LimiterState::Throttle);
                    inner.throttle_streak = 0;
                    inner.recover_streak = 0;
                }
            }
            LimiterState::Throttle => {
                let collapse = inner.consecutive_rate_limited >= cfg.n_throttle
                    || inner.long.error_rate(now) > cfg.p_sleep;
                if collapse {
                    self.enter_sleep(inner, now);
                    return;
                }

                let rate = inner.short.error_rate(now);
                if rate < cfg.p_recover {
                    inner.recover_streak += 1;
                } else {
                    inner.recover_streak = 0;
                }
                if inner.recover_streak >= cfg.hysteresis {
                    Self::transition(inner, LimiterState::Normal);
                    self.reset_recovery(inner);
                }
            }
            LimiterState::Sleep => {
                // In-flight calls may still complete while asleep; record
                // only, the timer drives the next transition.
            }
            LimiterState::HalfOpen => {
                if outcome == CallOutcome::Success {
                    inner.probe_successes += 1;
                    if inner.probe_successes >= cfg.half_open_probes {
                        Self::transition(inner, LimiterState::Normal);
                        self.reset_recovery(inner);
                    }
                } else {
                    // Failed probe: back to sleep with an escalated cooldown
                    // so a flapping upstream is probed less and less often.
                    inner.probe_successes = 0;
                    inner.current_cooldown = Duration::from_secs_f64(
                        (inner.current_cooldown.as_secs_f64() * cfg.cooldown_factor)
                            .min(cfg.sleep_max.as_secs_f64()),
                    );
                    warn!(cooldown = ?inner.current_cooldown, "half-open probe failed");
                    self.enter_sleep(inner, now);
                }
            }
            LimiterState::CacheOnly => {
                if outcome == CallOutcome::Success {
                    info!("cache-only recovery probe succeeded");
                    Self::transition(inner, LimiterState::HalfOpen);
                    inner.probe_successes = 1;
                }
            }
        }
    }

    fn enter_sleep(&self, inner: &mut Inner, now: Instant) {
        Self::transition(inner, LimiterState::Sleep);
        inner.sleep_until = Some(now + inner.current_cooldown);
        if inner.open_since.is_none() {
            inner.open_since = Some(now);
        }
    }

    fn reset_recovery(&self, inner: &mut Inner) {
        inner.current_cooldown = self.config.sleep_min;
        inner.sleep_until = None;
        inner.open_since = None;
        inner.last_probe = None;
        inner.throttle_streak = 0;
        inner.recover_streak = 0;
        inner.probe_successes = 0;
    }

    fn transition(inner: &mut Inner, to: LimiterState) {
        if inner.state != to {
            info!(from = ?inner.state, ?to, "rate limiter state transition");
            inner.state = to;
        }
    }

    /// Current state (observational; may change immediately after).
    pub fn state(&self) -> LimiterState {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).state
    }

    /// Operator override: stop all live traffic and serve from cache.
    pub fn force_cache_only(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Self::transition(&mut inner, LimiterState::CacheOnly);
        inner.last_probe = Some(Instant::now());
    }

    /// Snapshot of the limiter's internals.
    pub fn stats(&self) -> LimiterStats {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        LimiterStats {
            state: inner.state,
            short_error_rate: inner.short.error_rate(now),
            long_error_rate: inner.long.error_rate(now),
            consecutive_rate_limited: inner.consecutive_rate_limited,
            consecutive_failures: inner.consecutive_failures,
            bucket: inner.bucket.stats(),
        }
    }
}

/// Statistics snapshot for the rate limiter.
#[derive(Debug, Clone, Copy)]
pub struct LimiterStats {
    pub state: LimiterState,
    pub short_error_rate: f64,
    pub long_error_rate: f64,
    pub consecutive_rate_limited: u32,
    pub consecutive_failures: u32,
    pub bucket: RateLimitStats,
}
