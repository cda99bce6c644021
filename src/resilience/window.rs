//! Sliding window of recent call outcomes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Outcome of a completed API call, as seen by the rate limiter.
///
/// Non-retryable client responses (401/403/404/422) are the caller's
/// problem and never enter the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    RateLimited,
    ServerError,
    Timeout,
    ConnectFailure,
}

impl CallOutcome {
    pub fn is_error(&self) -> bool {
        !matches!(self, CallOutcome::Success)
    }
}

/// Ring buffer of call outcomes over a fixed span, trimmed lazily on read.
#[derive(Debug)]
pub struct ErrorWindow {
    span: Duration,
    samples: VecDeque<(Instant, CallOutcome)>,
}

impl ErrorWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, now: Instant, outcome: CallOutcome) {
        self.samples.push_back((now, outcome));
    }

    fn trim(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > self.span {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Fraction of samples in the window that are errors. Empty window = 0.
    pub fn error_rate(&mut self, now: Instant) -> f64 {
        self.trim(now);
        if self.samples.is_empty() {
            return 0.0;
        }
        let errors = self
            .samples
            .iter()
            .filter(|(_, outcome)| outcome.is_error())
            .count();
        errors as f64 / self.samples.len() as f64
    }

    pub fn len(&mut self, now: Instant) -> usize {
        self.trim(now);
        self.samples.len()
    }

    pub fn is_empty(&mut self, now: Instant) -> bool {
        self.len(now) == 0
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
