//! Error types for the metamatch core.
//!
//! The taxonomy follows one rule: per-item faults become data, systemic
//! faults become errors. An upstream 5xx after exhausted retries is a typed
//! [`ClientError::Unavailable`], not a panic; a corrupted cache entry is a
//! miss, not an error; a full disk is fatal because the pipeline cannot make
//! progress without its store.

use thiserror::Error;

/// Errors produced by a single call against the upstream metadata API.
///
/// Variants map one-to-one onto the failure classes the rate limiter and the
/// retry policy care about, so classification is a `match`, never substring
/// inspection of an error message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ApiError {
    /// HTTP 429. Carries the raw `Retry-After` header value when present.
    #[error("rate limited by upstream (429)")]
    RateLimited { retry_after: Option<String> },

    /// HTTP 5xx.
    #[error("upstream server error: HTTP {0}")]
    Server(u16),

    /// Connect or read timeout.
    #[error("request timed out")]
    Timeout,

    /// DNS resolution or connection failure.
    #[error("connection failed: {0}")]
    Connect(String),

    /// HTTP 401. Distinguished from other client errors because it implies a
    /// misconfigured credential, not a transient fault.
    #[error("invalid credentials (401)")]
    Unauthorized,

    /// HTTP 403/404/422 and other non-retryable client responses.
    #[error("client error: HTTP {0}")]
    Client(u16),

    /// The upstream answered 200 but the body could not be decoded.
    #[error("malformed upstream response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Build an error from an HTTP status code, keeping any `Retry-After`
    /// header for the 429 case.
    pub fn from_status(status: u16, retry_after: Option<String>) -> Self {
        match status {
            429 => ApiError::RateLimited { retry_after },
            401 => ApiError::Unauthorized,
            s if (500..600).contains(&s) => ApiError::Server(s),
            s => ApiError::Client(s),
        }
    }

    /// Whether a retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimited { .. }
                | ApiError::Server(_)
                | ApiError::Timeout
                | ApiError::Connect(_)
        )
    }

    /// The raw `Retry-After` value, if the upstream supplied one.
    pub fn retry_after(&self) -> Option<&str> {
        match self {
            ApiError::RateLimited { retry_after } => retry_after.as_deref(),
            _ => None,
        }
    }
}

/// Errors produced by the persistent cache store.
///
/// Corruption of an individual entry is deliberately *not* represented here:
/// the store quarantines the bad file and reports a miss instead.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CacheError {
    /// Underlying filesystem failure (includes disk-full, which callers
    /// should treat as fatal for the run).
    #[error("cache I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// An entry could not be serialized for writing.
    #[error("cache serialization failure: {0}")]
    Serialization(String),

    /// The payload contains a credential-like field and was refused.
    #[error("payload rejected: contains credential-like field `{field}`")]
    CredentialGuard { field: String },
}

/// Errors surfaced by the resilient API client.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ClientError {
    /// Retries were exhausted against a transiently failing upstream.
    #[error("upstream unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: ApiError },

    /// The upstream rejected the request with a non-retryable status.
    #[error("upstream rejected request: {0}")]
    Rejected(ApiError),

    /// The cache store failed in a way that prevents progress.
    #[error("cache store failure: {0}")]
    Cache(#[from] CacheError),
}

impl ClientError {
    /// True when the failure indicates a misconfigured API credential.
    pub fn is_credential_failure(&self) -> bool {
        matches!(self, ClientError::Rejected(ApiError::Unauthorized))
    }
}

/// Fatal pipeline-level conditions.
///
/// Per-file failures never appear here; they travel through the result
/// stream as failed `MatchResult`s.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PipelineError {
    /// The scan root does not exist or is not a directory.
    #[error("scan root is not a directory: {0}")]
    InvalidRoot(std::path::PathBuf),

    /// A stage's output channel closed while work remained.
    #[error("pipeline channel closed unexpectedly")]
    ChannelClosed,

    /// The cache store became unusable mid-run.
    #[error("cache store failure: {0}")]
    Cache(#[from] CacheError),
}
