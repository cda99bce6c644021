//! Resilient metadata API client.
//!
//! Every lookup follows the same path: cache first, then the rate limiter's
//! decision loop, then at most one HTTP call per attempt with bounded
//! retries. Failures degrade in order of preference: retry, then cached
//! data, then an explicit "no data" outcome. Staleness beats unavailability.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::cache::{CacheKind, CacheStore};
use crate::error::{ApiError, CacheError, ClientError};
use crate::resilience::{CallOutcome, Decision, RateLimiter, RetryPolicy};

/// Media kind a search is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Tv,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Tv => "tv",
        }
    }
}

/// A normalized search request.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub title: String,
    pub kind: MediaKind,
    pub year: Option<i32>,
    pub language: String,
}

impl SearchQuery {
    pub fn new(title: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            title: title.into(),
            kind,
            year: None,
            language: "en".to_string(),
        }
    }

    pub fn with_year(mut self, year: Option<i32>) -> Self {
        self.year = year;
        self
    }

    /// Deterministic cache key, e.g. `search:tv:example:lang=en`.
    pub fn cache_key(&self) -> String {
        let title = normalize_for_key(&self.title);
        match self.year {
            Some(year) => format!(
                "search:{}:{}:y={}:lang={}",
                self.kind.as_str(),
                title,
                year,
                self.language
            ),
            None => format!("search:{}:{}:lang={}", self.kind.as_str(), title, self.language),
        }
    }
}

fn normalize_for_key(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Where a lookup's data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Served from the persistent cache.
    Cache,
    /// Fetched live from the upstream API.
    Live,
    /// No data available: cache-only mode with no cached entry.
    None,
}

/// One candidate row parsed out of a search response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCandidate {
    pub external_id: String,
    pub title: String,
    pub year: Option<i32>,
    pub kind: Option<MediaKind>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

/// Result of a resilient search.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub candidates: Vec<ApiCandidate>,
    pub origin: Origin,
}

/// Result of a resilient details lookup.
#[derive(Debug, Clone)]
pub struct DetailsOutcome {
    pub details: Option<Value>,
    pub origin: Origin,
}

/// Transport seam for the upstream metadata API.
///
/// Implementations perform exactly one HTTP call per invocation; all
/// retrying, rate limiting, and caching lives above this trait.
#[async_trait]
pub trait MetadataApi: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Value, ApiError>;
    async fn details(&self, id: &str) -> Result<Value, ApiError>;
}

/// Configuration for the HTTP transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpApiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.example.org/v3".to_string(),
            api_key: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// reqwest-backed [`MetadataApi`] implementation.
pub struct HttpMetadataApi {
    client: reqwest::Client,
    config: HttpApiConfig,
}

impl HttpMetadataApi {
    pub fn new(config: HttpApiConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(32)
            .build()
            .map_err(|e| ApiError::Connect(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    async fn get_json(&self, url: String, params: Vec<(&str, String)>) -> Result<Value, ApiError> {
        let mut request = self.client.get(url).query(&params);
        if let Some(key) = self.config.api_key.as_deref() {
            request = request.query(&[("api_key", key)]);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                ApiError::Timeout
            } else {
                ApiError::Connect(err.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(ApiError::from_status(status.as_u16(), retry_after));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl MetadataApi for HttpMetadataApi {
    async fn search(&self, query: &SearchQuery) -> Result<Value, ApiError> {
        let url = format!("{}/search/{}", self.config.base_url, query.kind.as_str());
        let mut params = vec![
            ("query", query.title.clone()),
            ("language", query.language.clone()),
        ];
        if let Some(year) = query.year {
            params.push(("year", year.to_string()));
        }
        self.get_json(url, params).await
    }

    async fn details(&self, id: &str) -> Result<Value, ApiError> {
        let url = format!("{}/details/{id}", self.config.base_url);
        self.get_json(url, Vec::new()).await
    }
}

#[derive(Clone, Copy)]
enum Request<'a> {
    Search(&'a SearchQuery),
    Details(&'a str),
}

/// The resilient client: rate limiter + cache + transport, composed.
///
/// All components are injected; nothing here is process-global.
pub struct ResilientClient {
    api: Arc<dyn MetadataApi>,
    limiter: Arc<RateLimiter>,
    cache: Arc<CacheStore>,
    policy: RetryPolicy,
    inflight: Arc<Semaphore>,
}

impl ResilientClient {
    pub fn new(
        api: Arc<dyn MetadataApi>,
        limiter: Arc<RateLimiter>,
        cache: Arc<CacheStore>,
        policy: RetryPolicy,
        concurrency_cap: usize,
    ) -> Self {
        Self {
            api,
            limiter,
            cache,
            policy,
            inflight: Arc::new(Semaphore::new(concurrency_cap.max(1))),
        }
    }

    /// Search for candidates matching `query`.
    pub async fn search(&self, query: &SearchQuery) -> Result<SearchOutcome, ClientError> {
        let key = query.cache_key();
        let (payload, origin) = self
            .lookup(&key, CacheKind::Search, Request::Search(query))
            .await?;
        let candidates = payload.as_ref().map(parse_candidates).unwrap_or_default();
        Ok(SearchOutcome { candidates, origin })
    }

    /// Fetch full details for a previously matched candidate.
    pub async fn details(&self, id: &str) -> Result<DetailsOutcome, ClientError> {
        let key = format!("details:{id}");
        let (payload, origin) = self
            .lookup(&key, CacheKind::Details, Request::Details(id))
            .await?;
        Ok(DetailsOutcome {
            details: payload,
            origin,
        })
    }

    async fn lookup(
        &self,
        key: &str,
        kind: CacheKind,
        request: Request<'_>,
    ) -> Result<(Option<Value>, Origin), ClientError> {
        if let Some(entry) = self.cache.get(key) {
            return Ok((Some(entry.payload), Origin::Cache));
        }

        let mut attempts: u32 = 0;
        loop {
            match self.limiter.before_call() {
                Decision::UseCacheOnly => {
                    // Cache already missed above; prefer "no data" over
                    // blocking on a failing upstream.
                    debug!(%key, "cache-only mode with no cached entry");
                    return Ok((None, Origin::None));
                }
                Decision::Wait(delay) => {
                    tokio::time::sleep(delay).await;
                }
                Decision::Proceed => {
                    // Both caps hold at once: the token was consumed in
                    // before_call, the permit bounds simultaneous requests.
                    let _permit = self
                        .inflight
                        .acquire()
                        .await
                        .expect("in-flight semaphore is never closed");

                    match self.call(request).await {
                        Ok(payload) => {
                            self.limiter.after_call(CallOutcome::Success);
                            match self.cache.put(
                                key,
                                kind,
                                payload.clone(),
                                self.cache.config().default_ttl,
                            ) {
                                Ok(()) => {}
                                Err(CacheError::CredentialGuard { field }) => {
                                    warn!(%key, %field, "response not cached: credential guard");
                                }
                                Err(err) => return Err(err.into()),
                            }
                            return Ok((Some(payload), Origin::Live));
                        }
                        Err(err) => {
                            if let Some(outcome) = outcome_of(&err) {
                                self.limiter.after_call(outcome);
                            }
                            if !err.is_transient() {
                                return Err(ClientError::Rejected(err));
                            }

                            attempts += 1;
                            if attempts >= self.policy.config().max_attempts {
                                return Err(ClientError::Unavailable { attempts, last: err });
                            }

                            let delay = self.policy.compute_delay(
                                attempts - 1,
                                err.retry_after(),
                                Utc::now(),
                            );
                            debug!(%key, attempt = attempts, ?delay, %err, "retrying after failure");
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }
    }

    async fn call(&self, request: Request<'_>) -> Result<Value, ApiError> {
        match request {
            Request::Search(query) => self.api.search(query).await,
            Request::Details(id) => self.api.details(id).await,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }
}

fn outcome_of(err: &ApiError) -> Option<CallOutcome> {
    match err {
        ApiError::RateLimited { .. } => Some(CallOutcome::RateLimited),
        ApiError::Server(_) => Some(CallOutcome::ServerError),
        ApiError::Timeout => Some(CallOutcome::Timeout),
        ApiError::Connect(_) => Some(CallOutcome::ConnectFailure),
        // Client-side rejections are the caller's problem; they never feed
        // the error window.
        ApiError::Unauthorized | ApiError::Client(_) | ApiError::InvalidResponse(_) => None,
    }
}

/// Parse search-style payloads (`{"results": [...]}`) into candidates.
/// Unrecognized rows are skipped rather than failing the whole response.
fn parse_candidates(payload: &Value) -> Vec<ApiCandidate> {
    let Some(results) = payload.get("results").and_then(Value::as_array) else {
        return Vec::new();
    };

    results
        .iter()
        .filter_map(|row| {
            let external_id = match row.get("id") {
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::String(s)) => s.clone(),
                _ => return None,
            };
            let title = row
                .get("title")
                .or_else(|| row.get("name"))
                .and_then(Value::as_str)?
                .to_string();
            let year = row
                .get("year")
                .and_then(Value::as_i64)
                .map(|y| y as i32)
                .or_else(|| {
                    row.get("release_date")
                        .or_else(|| row.get("first_air_date"))
                        .and_then(Value::as_str)
                        .and_then(|date| date.get(..4))
                        .and_then(|y| y.parse().ok())
                });
            let kind = row
                .get("media_type")
                .and_then(Value::as_str)
                .and_then(|k| match k {
                    "movie" => Some(MediaKind::Movie),
                    "tv" => Some(MediaKind::Tv),
                    _ => None,
                });
            let season = row
                .get("season_number")
                .and_then(Value::as_u64)
                .map(|s| s as u32);
            let episode = row
                .get("episode_number")
                .and_then(Value::as_u64)
                .map(|e| e as u32);
            Some(ApiCandidate {
                external_id,
                title,
                year,
                kind,
                season,
                episode,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::resilience::{LimiterConfig, RateLimitConfig, RetryConfig};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Scripted transport: pops one pre-programmed response per call.
    struct ScriptedApi {
        responses: Mutex<VecDeque<Result<Value, ApiError>>>,
        calls: AtomicU64,
    }

    impl ScriptedApi {
        fn new(responses: Vec<Result<Value, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicU64::new(0),
            })
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }

        fn next(&self) -> Result<Value, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ApiError::Server(500)))
        }
    }

    #[async_trait]
    impl MetadataApi for ScriptedApi {
        async fn search(&self, _query: &SearchQuery) -> Result<Value, ApiError> {
            self.next()
        }

        async fn details(&self, _id: &str) -> Result<Value, ApiError> {
            self.next()
        }
    }

    fn client_with(
        api: Arc<ScriptedApi>,
        dir: &std::path::Path,
    ) -> (ResilientClient, Arc<RateLimiter>, Arc<CacheStore>) {
        let limiter = Arc::new(RateLimiter::new(
            LimiterConfig::default(),
            RateLimitConfig::default(),
        ));
        let cache = Arc::new(CacheStore::open(dir, CacheConfig::default()).unwrap());
        let client = ResilientClient::new(
            api,
            limiter.clone(),
            cache.clone(),
            RetryPolicy::new(RetryConfig::default().with_base_delay(Duration::from_millis(1))),
            4,
        );
        (client, limiter, cache)
    }

    fn search_payload() -> Value {
        json!({"results": [
            {"id": 42, "name": "Example", "first_air_date": "2019-04-01", "media_type": "tv"},
        ]})
    }

    #[tokio::test]
    async fn live_call_populates_cache() {
        let dir = tempdir().unwrap();
        let api = ScriptedApi::new(vec![Ok(search_payload())]);
        let (client, _limiter, cache) = client_with(api.clone(), dir.path());

        let query = SearchQuery::new("Example", MediaKind::Tv);
        let outcome = client.search(&query).await.unwrap();

        assert_eq!(outcome.origin, Origin::Live);
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].external_id, "42");
        assert_eq!(outcome.candidates[0].year, Some(2019));
        assert_eq!(api.calls(), 1);
        assert!(cache.get(&query.cache_key()).is_some());
    }

    #[tokio::test]
    async fn second_lookup_hits_cache() {
        let dir = tempdir().unwrap();
        let api = ScriptedApi::new(vec![Ok(search_payload())]);
        let (client, _limiter, _cache) = client_with(api.clone(), dir.path());

        let query = SearchQuery::new("Example", MediaKind::Tv);
        client.search(&query).await.unwrap();
        let outcome = client.search(&query).await.unwrap();

        assert_eq!(outcome.origin, Origin::Cache);
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn cache_only_mode_serves_cache_without_http() {
        let dir = tempdir().unwrap();
        let api = ScriptedApi::new(vec![Ok(search_payload())]);
        let (client, limiter, cache) = client_with(api.clone(), dir.path());

        let query = SearchQuery::new("Example", MediaKind::Tv);
        cache
            .put(
                &query.cache_key(),
                CacheKind::Search,
                search_payload(),
                None,
            )
            .unwrap();

        limiter.force_cache_only();
        let outcome = client.search(&query).await.unwrap();

        assert_eq!(outcome.origin, Origin::Cache);
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn cache_only_mode_without_entry_returns_none() {
        let dir = tempdir().unwrap();
        let api = ScriptedApi::new(vec![Ok(search_payload())]);
        let (client, limiter, _cache) = client_with(api.clone(), dir.path());

        limiter.force_cache_only();
        let outcome = client
            .search(&SearchQuery::new("Unknown", MediaKind::Movie))
            .await
            .unwrap();

        assert_eq!(outcome.origin, Origin::None);
        assert!(outcome.candidates.is_empty());
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn non_retryable_error_surfaces_immediately() {
        let dir = tempdir().unwrap();
        let api = ScriptedApi::new(vec![Err(ApiError::Client(404))]);
        let (client, _limiter, _cache) = client_with(api.clone(), dir.path());

        let result = client.search(&SearchQuery::new("Nope", MediaKind::Movie)).await;
        assert!(matches!(
            result,
            Err(ClientError::Rejected(ApiError::Client(404)))
        ));
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn unauthorized_is_distinguishable() {
        let dir = tempdir().unwrap();
        let api = ScriptedApi::new(vec![Err(ApiError::Unauthorized)]);
        let (client, _limiter, _cache) = client_with(api.clone(), dir.path());

        let err = client
            .search(&SearchQuery::new("Any", MediaKind::Movie))
            .await
            .unwrap_err();
        assert!(err.is_credential_failure());
    }

    #[tokio::test]
    async fn transient_errors_retry_then_surface_unavailable() {
        let dir = tempdir().unwrap();
        let api = ScriptedApi::new(vec![
            Err(ApiError::Server(503)),
            Err(ApiError::Timeout),
            Err(ApiError::Server(502)),
        ]);
        let (client, _limiter, _cache) = client_with(api.clone(), dir.path());

        let result = client.search(&SearchQuery::new("Flaky", MediaKind::Tv)).await;
        match result {
            Err(ClientError::Unavailable { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Unavailable, got {other:?}"),
        }
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test]
    async fn transient_error_then_success_recovers() {
        let dir = tempdir().unwrap();
        let api = ScriptedApi::new(vec![Err(ApiError::Timeout), Ok(search_payload())]);
        let (client, _limiter, _cache) = client_with(api.clone(), dir.path());

        let outcome = client
            .search(&SearchQuery::new("Example", MediaKind::Tv))
            .await
            .unwrap();
        assert_eq!(outcome.origin, Origin::Live);
        assert_eq!(api.calls(), 2);
    }

    #[test]
    fn cache_key_shape_matches_convention() {
        let query = SearchQuery::new("  Example  Show ", MediaKind::Tv);
        assert_eq!(query.cache_key(), "search:tv:example show:lang=en");

        let with_year = SearchQuery::new("Dune", MediaKind::Movie).with_year(Some(2021));
        assert_eq!(with_year.cache_key(), "search:movie:dune:y=2021:lang=en");
    }

    #[test]
    fn parse_candidates_tolerates_junk_rows() {
        let payload = json!({"results": [
            {"id": 1, "title": "Good", "release_date": "2020-01-01"},
            {"title": "No id"},
            {"id": 2},
            {"id": 3, "name": "Named", "media_type": "tv",
             "season_number": 2, "episode_number": 5},
        ]});
        let candidates = parse_candidates(&payload);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].year, Some(2020));
        assert_eq!(candidates[0].season, None);
        assert_eq!(candidates[1].kind, Some(MediaKind::Tv));
        assert_eq!(candidates[1].season, Some(2));
        assert_eq!(candidates[1].episode, Some(5));
    }
}
