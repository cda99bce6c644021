//! Resilience core for media-library organizers.
//!
//! Everything between "a directory full of release-named files" and "a
//! confident metadata match" lives here: a token-bucket rate limiter driving
//! a five-state call gate, retry with server-hinted backoff, a persistent
//! response cache that survives upstream outages, and a bounded
//! scan/parse/match pipeline that degrades per file instead of failing per
//! run.
//!
//! The pieces compose by injection: construct them once, share them by
//! `Arc`, and wire them together with [`build_pipeline`] or by hand:
//!
//! ```no_run
//! use std::sync::Arc;
//! use metamatch::{build_pipeline, CancelToken, CoreConfig, HttpApiConfig, HttpMetadataApi};
//!
//! # #[tokio::main] async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CoreConfig::default();
//! let api = Arc::new(HttpMetadataApi::new(HttpApiConfig::default())?);
//! let pipeline = build_pipeline(&config, api, "/var/cache/metamatch")?;
//!
//! let mut results = pipeline.run("/media/library", CancelToken::new())?;
//! while let Some(result) = results.recv().await {
//!     println!("{:?}: {:?}", result.path, result.status);
//! }
//! # Ok(()) }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod matcher;
pub mod pipeline;
pub mod resilience;

pub use cache::{CacheConfig, CacheEntry, CacheKind, CacheStats, CacheStore};
pub use client::{
    ApiCandidate, DetailsOutcome, HttpApiConfig, HttpMetadataApi, MediaKind, MetadataApi, Origin,
    ResilientClient, SearchOutcome, SearchQuery,
};
pub use config::{ConfigError, CoreConfig};
pub use error::{ApiError, CacheError, ClientError, PipelineError};
pub use matcher::{MatchCandidate, MatchConfig, MatchOutcome, MatchQuery, MatchingEngine};
pub use pipeline::{
    CancelToken, FilenameParser, MatchResult, MatchStatus, ParseError, ParsedRecord,
    PipelineConfig, RecordParser, ScanParsePipeline, ScanTask,
};
pub use resilience::{
    CallOutcome, Decision, LimiterConfig, LimiterState, RateLimitConfig, RateLimiter, RetryConfig,
    RetryPolicy, TokenBucket,
};
pub use resilience::{LimiterStats, RateLimitStats};

use std::path::Path;
use std::sync::Arc;

/// Wire a full pipeline from one [`CoreConfig`] and an injected transport.
///
/// The cache store opens (or creates) `cache_root`; everything else is
/// built from the config's sections. The returned pipeline uses the default
/// [`FilenameParser`]; use [`ScanParsePipeline::new`] directly to inject a
/// different parser.
pub fn build_pipeline(
    config: &CoreConfig,
    api: Arc<dyn MetadataApi>,
    cache_root: impl AsRef<Path>,
) -> Result<ScanParsePipeline, CacheError> {
    let cache = Arc::new(CacheStore::open(
        cache_root.as_ref().to_path_buf(),
        config.cache,
    )?);
    let limiter = Arc::new(RateLimiter::new(config.limiter, config.rate_limit));
    let client = Arc::new(ResilientClient::new(
        api,
        limiter,
        cache,
        RetryPolicy::new(config.retry),
        config.concurrency_cap,
    ));
    let engine = Arc::new(MatchingEngine::new(client, config.matcher));
    Ok(ScanParsePipeline::new(
        config.pipeline.clone(),
        Arc::new(FilenameParser),
        engine,
    ))
}
