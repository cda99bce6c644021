//! Candidate scoring and match selection.
//!
//! Scores combine title similarity, year proximity, and metadata agreement
//! (season/episode numbers when both sides declare them, media kind
//! otherwise) under configurable weights. When a full-title search comes
//! back weak, the engine retries with progressively shortened queries
//! (release names often carry trailing junk the upstream index does not
//! know about).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::client::{ApiCandidate, MediaKind, Origin, ResilientClient, SearchQuery};
use crate::error::ClientError;

/// Weights and thresholds for match scoring.
///
/// The three weights should sum to 1.0 so confidences stay in `[0, 1]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MatchConfig {
    pub title_weight: f64,
    pub year_weight: f64,
    pub metadata_weight: f64,
    /// At or above this, the engine accepts the match and stops searching.
    pub high_confidence: f64,
    /// Below this, a candidate is discarded outright.
    pub min_confidence: f64,
    /// How many trailing words may be dropped in fallback searches.
    pub max_fallback_rounds: u32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            title_weight: 0.65,
            year_weight: 0.20,
            metadata_weight: 0.15,
            high_confidence: 0.75,
            min_confidence: 0.30,
            max_fallback_rounds: 3,
        }
    }
}

impl MatchConfig {
    pub fn with_weights(mut self, title: f64, year: f64, metadata: f64) -> Self {
        self.title_weight = title;
        self.year_weight = year;
        self.metadata_weight = metadata;
        self
    }

    pub fn with_thresholds(mut self, high: f64, min: f64) -> Self {
        self.high_confidence = high;
        self.min_confidence = min;
        self
    }

    pub fn with_max_fallback_rounds(mut self, rounds: u32) -> Self {
        self.max_fallback_rounds = rounds;
        self
    }
}

/// A scored candidate, ready for ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub external_id: String,
    pub title: String,
    pub year: Option<i32>,
    pub confidence: f64,
    /// Human-readable scoring breakdown, for logs and debugging.
    pub evidence: Vec<String>,
}

/// What was parsed from disk, ready for lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchQuery {
    pub title: String,
    pub kind: MediaKind,
    pub year: Option<i32>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

impl MatchQuery {
    pub fn new(title: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            title: title.into(),
            kind,
            year: None,
            season: None,
            episode: None,
        }
    }

    pub fn with_year(mut self, year: Option<i32>) -> Self {
        self.year = year;
        self
    }

    pub fn with_episode(mut self, season: u32, episode: u32) -> Self {
        self.season = Some(season);
        self.episode = Some(episode);
        self
    }
}

/// The engine's verdict for one lookup.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    /// Best candidate at or above the minimum confidence, if any.
    pub best: Option<MatchCandidate>,
    /// Where the winning (or final) search's data came from.
    pub origin: Origin,
    /// How many search rounds ran, fallbacks included.
    pub rounds: u32,
}

/// Scores search results against what was parsed from disk and picks the
/// best match.
pub struct MatchingEngine {
    client: Arc<ResilientClient>,
    config: MatchConfig,
}

impl MatchingEngine {
    pub fn new(client: Arc<ResilientClient>, config: MatchConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Find the best candidate for a parsed title.
    ///
    /// Runs the full title first, then shortens by one trailing word per
    /// fallback round until a high-confidence match appears or the rounds
    /// are exhausted. Credential and I/O failures surface immediately; an
    /// empty result set is not an error.
    pub async fn find_match(&self, query: &MatchQuery) -> Result<MatchOutcome, ClientError> {
        let normalized = normalize_title(&query.title);
        let words: Vec<&str> = normalized.split_whitespace().collect();
        if words.is_empty() {
            return Ok(MatchOutcome {
                best: None,
                origin: Origin::None,
                rounds: 0,
            });
        }

        let mut best: Option<MatchCandidate> = None;
        let mut best_origin = Origin::None;
        let mut last_origin = Origin::None;
        let mut rounds = 0;

        let max_rounds = (self.config.max_fallback_rounds as usize + 1).min(words.len());
        for round in 0..max_rounds {
            let query_title = words[..words.len() - round].join(" ");
            let search = SearchQuery::new(query_title.clone(), query.kind).with_year(query.year);
            let outcome = self.client.search(&search).await?;
            rounds += 1;
            last_origin = outcome.origin;

            // Score against this round's query: once trailing words have
            // been dropped as junk they should not drag similarity down.
            let round_best = outcome
                .candidates
                .iter()
                .map(|c| self.score(&query_title, query, c))
                .filter(|c| c.confidence >= self.config.min_confidence)
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence));

            if let Some(candidate) = round_best {
                let improves = best
                    .as_ref()
                    .map(|b| candidate.confidence > b.confidence)
                    .unwrap_or(true);
                if improves {
                    best_origin = outcome.origin;
                    best = Some(candidate);
                }
            }

            if let Some(b) = &best {
                if b.confidence >= self.config.high_confidence {
                    break;
                }
            }

            if round + 1 < max_rounds {
                debug!(query = %query_title, round, "weak results, shortening query");
            }
        }

        let origin = if best.is_some() { best_origin } else { last_origin };
        Ok(MatchOutcome { best, origin, rounds })
    }

    /// Score one candidate against the parsed record.
    pub fn score(
        &self,
        normalized_title: &str,
        query: &MatchQuery,
        candidate: &ApiCandidate,
    ) -> MatchCandidate {
        let title_sim = title_similarity(normalized_title, &normalize_title(&candidate.title));
        let year_sim = year_score(query.year, candidate.year);
        let meta_sim = metadata_score(query, candidate);

        let confidence = self.config.title_weight * title_sim
            + self.config.year_weight * year_sim
            + self.config.metadata_weight * meta_sim;

        let evidence = vec![
            format!("title {title_sim:.2}"),
            format!("year {year_sim:.2}"),
            format!("metadata {meta_sim:.2}"),
        ];

        MatchCandidate {
            external_id: candidate.external_id.clone(),
            title: candidate.title.clone(),
            year: candidate.year,
            confidence,
            evidence,
        }
    }
}

/// Lowercase, strip separator punctuation, collapse whitespace.
pub fn normalize_title(raw: &str) -> String {
    let mut cleaned = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '.' | '_' | '-' | ':' | ',' | '(' | ')' | '[' | ']' => cleaned.push(' '),
            _ => cleaned.extend(ch.to_lowercase()),
        }
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Similarity in `[0, 1]` from Levenshtein distance over characters.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let longest = a_chars.len().max(b_chars.len());
    if longest == 0 {
        return 1.0;
    }
    let distance = levenshtein(&a_chars, &b_chars);
    1.0 - distance as f64 / longest as f64
}

/// Classic two-row Levenshtein distance.
fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Year proximity score. A missing year on either side is neutral rather
/// than disqualifying; release years are often off by one across regions.
fn year_score(parsed: Option<i32>, candidate: Option<i32>) -> f64 {
    match (parsed, candidate) {
        (Some(a), Some(b)) => match (a - b).abs() {
            0 => 1.0,
            1 => 0.7,
            2 => 0.3,
            _ => 0.0,
        },
        _ => 0.5,
    }
}

/// Media-kind agreement. Candidates without a declared kind are neutral.
fn kind_score(parsed: MediaKind, candidate: Option<MediaKind>) -> f64 {
    match candidate {
        Some(kind) if kind == parsed => 1.0,
        Some(_) => 0.0,
        None => 0.5,
    }
}

/// Metadata agreement: exact season/episode overlap when both sides carry
/// the numbers, media-kind agreement otherwise.
fn metadata_score(query: &MatchQuery, candidate: &ApiCandidate) -> f64 {
    match (query.season, query.episode, candidate.season, candidate.episode) {
        (Some(qs), Some(qe), Some(cs), Some(ce)) => {
            if qs == cs && qe == ce {
                1.0
            } else {
                0.0
            }
        }
        _ => kind_score(query.kind, candidate.kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheStore};
    use crate::client::MetadataApi;
    use crate::error::ApiError;
    use crate::resilience::{LimiterConfig, RateLimitConfig, RateLimiter, RetryConfig, RetryPolicy};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[test]
    fn normalize_strips_release_noise() {
        assert_eq!(
            normalize_title("The.Example_Show-(2019)"),
            "the example show 2019"
        );
        assert_eq!(normalize_title("  Dune:  Part   Two  "), "dune part two");
    }

    #[test]
    fn levenshtein_basics() {
        let chars = |s: &str| s.chars().collect::<Vec<_>>();
        assert_eq!(levenshtein(&chars("kitten"), &chars("sitting")), 3);
        assert_eq!(levenshtein(&chars("abc"), &chars("abc")), 0);
        assert_eq!(levenshtein(&chars(""), &chars("abc")), 3);
    }

    #[test]
    fn title_similarity_bounds() {
        assert_eq!(title_similarity("dune", "dune"), 1.0);
        assert_eq!(title_similarity("", ""), 1.0);
        let sim = title_similarity("dune", "xxxx");
        assert!(sim >= 0.0 && sim < 0.5);
    }

    #[test]
    fn year_proximity_tiers() {
        assert_eq!(year_score(Some(2020), Some(2020)), 1.0);
        assert_eq!(year_score(Some(2020), Some(2021)), 0.7);
        assert_eq!(year_score(Some(2020), Some(2018)), 0.3);
        assert_eq!(year_score(Some(2020), Some(2000)), 0.0);
        assert_eq!(year_score(None, Some(2020)), 0.5);
        assert_eq!(year_score(Some(2020), None), 0.5);
    }

    #[test]
    fn kind_agreement_tiers() {
        assert_eq!(kind_score(MediaKind::Tv, Some(MediaKind::Tv)), 1.0);
        assert_eq!(kind_score(MediaKind::Tv, Some(MediaKind::Movie)), 0.0);
        assert_eq!(kind_score(MediaKind::Tv, None), 0.5);
    }

    struct ScriptedApi {
        responses: Mutex<VecDeque<Value>>,
    }

    #[async_trait]
    impl MetadataApi for ScriptedApi {
        async fn search(&self, _query: &SearchQuery) -> Result<Value, ApiError> {
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| json!({"results": []})))
        }

        async fn details(&self, _id: &str) -> Result<Value, ApiError> {
            Ok(json!({}))
        }
    }

    fn engine_with(dir: &std::path::Path, responses: Vec<Value>) -> MatchingEngine {
        let api = Arc::new(ScriptedApi {
            responses: Mutex::new(responses.into()),
        });
        let limiter = Arc::new(RateLimiter::new(
            LimiterConfig::default(),
            RateLimitConfig::default(),
        ));
        let cache = Arc::new(CacheStore::open(dir, CacheConfig::default()).unwrap());
        let client = Arc::new(ResilientClient::new(
            api,
            limiter,
            cache,
            RetryPolicy::new(RetryConfig::default()),
            4,
        ));
        MatchingEngine::new(client, MatchConfig::default())
    }

    #[tokio::test]
    async fn exact_match_is_high_confidence() {
        let dir = tempdir().unwrap();
        let engine = engine_with(
            dir.path(),
            vec![json!({"results": [
                {"id": 1, "name": "Example Show", "first_air_date": "2019-01-01", "media_type": "tv"},
            ]})],
        );

        let outcome = engine
            .find_match(&MatchQuery::new("Example.Show", MediaKind::Tv).with_year(Some(2019)))
            .await
            .unwrap();

        let best = outcome.best.expect("should match");
        assert_eq!(best.external_id, "1");
        assert!(best.confidence >= engine.config().high_confidence);
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.origin, Origin::Live);
    }

    #[tokio::test]
    async fn fallback_shortens_query_until_hit() {
        let dir = tempdir().unwrap();
        // First two rounds come back empty; the third, shortened to
        // "example show", hits.
        let engine = engine_with(
            dir.path(),
            vec![
                json!({"results": []}),
                json!({"results": []}),
                json!({"results": [
                    {"id": 7, "name": "Example Show", "media_type": "tv"},
                ]}),
            ],
        );

        let outcome = engine
            .find_match(&MatchQuery::new("Example Show 1080p WEB", MediaKind::Tv))
            .await
            .unwrap();

        let best = outcome.best.expect("fallback should find it");
        assert_eq!(best.external_id, "7");
        assert_eq!(outcome.rounds, 3);
    }

    #[tokio::test]
    async fn weak_candidates_are_discarded() {
        let dir = tempdir().unwrap();
        let engine = engine_with(
            dir.path(),
            vec![json!({"results": [
                {"id": 9, "title": "Completely Unrelated Noise", "release_date": "1960-01-01", "media_type": "movie"},
            ]})],
        );

        let outcome = engine
            .find_match(&MatchQuery::new("Example", MediaKind::Tv).with_year(Some(2020)))
            .await
            .unwrap();
        assert!(outcome.best.is_none());
    }

    #[tokio::test]
    async fn single_word_title_runs_one_round() {
        let dir = tempdir().unwrap();
        let engine = engine_with(dir.path(), vec![json!({"results": []})]);

        let outcome = engine
            .find_match(&MatchQuery::new("Dune", MediaKind::Movie))
            .await
            .unwrap();
        assert!(outcome.best.is_none());
        assert_eq!(outcome.rounds, 1);
    }

    #[test]
    fn episode_overlap_drives_metadata_score() {
        let query = MatchQuery::new("example show", MediaKind::Tv).with_episode(1, 3);
        let hit = ApiCandidate {
            external_id: "1".to_string(),
            title: "Example Show".to_string(),
            year: None,
            kind: Some(MediaKind::Tv),
            season: Some(1),
            episode: Some(3),
        };
        let miss = ApiCandidate {
            season: Some(1),
            episode: Some(4),
            ..hit.clone()
        };
        let unnumbered = ApiCandidate {
            season: None,
            episode: None,
            ..hit.clone()
        };

        assert_eq!(metadata_score(&query, &hit), 1.0);
        assert_eq!(metadata_score(&query, &miss), 0.0);
        // Candidates without episode numbering fall back to kind agreement.
        assert_eq!(metadata_score(&query, &unnumbered), 1.0);
    }

    #[tokio::test]
    async fn matching_episode_outranks_same_title_sibling() {
        let dir = tempdir().unwrap();
        let engine = engine_with(
            dir.path(),
            vec![json!({"results": [
                {"id": 21, "name": "Example Show", "media_type": "tv",
                 "season_number": 1, "episode_number": 4},
                {"id": 22, "name": "Example Show", "media_type": "tv",
                 "season_number": 1, "episode_number": 3},
            ]})],
        );

        let outcome = engine
            .find_match(&MatchQuery::new("Example Show", MediaKind::Tv).with_episode(1, 3))
            .await
            .unwrap();

        let best = outcome.best.expect("should match");
        assert_eq!(best.external_id, "22");
        assert!(best.confidence >= engine.config().high_confidence);
    }
}
