//! Rate limiting, backoff, and the call-gating state machine.

pub mod backoff;
pub mod limiter;
pub mod rate_limit;
pub mod window;

pub use backoff::{parse_retry_after, RetryConfig, RetryPolicy};
pub use limiter::{Decision, LimiterConfig, LimiterState, LimiterStats, RateLimiter};
pub use rate_limit::{RateLimitConfig, RateLimitStats, TokenBucket};
pub use window::{CallOutcome, ErrorWindow};
