//! Bounded scan/parse/match pipeline.
//!
//! Three stages connected by bounded channels: a blocking filesystem walk, a
//! pool of parser workers, and a pool of match workers driving the resilient
//! client. Backpressure is structural: when a downstream stage stalls, the
//! bounded channels fill and upstream stages block instead of buffering
//! unboundedly.
//!
//! Per-file problems never abort the run. A file that fails to parse, or
//! whose lookup ultimately fails, still produces exactly one [`MatchResult`]
//! carrying the failure; cancellation drains queued work as `Cancelled`
//! results rather than dropping it silently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::client::{MediaKind, Origin};
use crate::error::PipelineError;
use crate::matcher::{normalize_title, MatchCandidate, MatchQuery, MatchingEngine};

/// Cooperative cancellation handle shared across pipeline stages.
///
/// Cancellation is a one-way latch: once set it never clears, and every
/// stage observes it at its next dequeue.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// One file discovered by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTask {
    pub path: PathBuf,
    /// When the scanner first saw the file.
    pub discovered_at: DateTime<Utc>,
}

/// What the parser extracted from a file name.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub path: PathBuf,
    pub title: String,
    pub year: Option<i32>,
    pub kind: MediaKind,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

/// A single file's parse failure. Travels through the result stream, never
/// up the call stack.
#[derive(Debug, Clone, thiserror::Error)]
#[error("parse failed: {reason}")]
pub struct ParseError {
    pub reason: String,
}

/// Seam for turning a path into a [`ParsedRecord`].
pub trait RecordParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<ParsedRecord, ParseError>;
}

/// Default parser for release-style file names like
/// `The.Example.Show.S01E03.1080p.mkv` or `Dune.2021.WEB.mkv`.
///
/// Heuristics only: an `SxxEyy` token marks a TV episode, ends the title,
/// and yields the season and episode numbers; otherwise the last plausible
/// year token ends the title and is taken as the release year.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilenameParser;

impl RecordParser for FilenameParser {
    fn parse(&self, path: &Path) -> Result<ParsedRecord, ParseError> {
        let stem = path
            .file_stem()
            .and_then(OsStr::to_str)
            .ok_or_else(|| ParseError {
                reason: "file name is not valid UTF-8".to_string(),
            })?;

        let normalized = normalize_title(stem);
        let tokens: Vec<&str> = normalized.split_whitespace().collect();

        let episode_mark = tokens
            .iter()
            .enumerate()
            .find_map(|(i, t)| parse_episode_token(t).map(|(s, e)| (i, s, e)));
        let year_at = tokens
            .iter()
            .enumerate()
            .skip(1)
            .rev()
            .find(|(_, t)| parse_year(t).is_some())
            .map(|(i, _)| i);

        let (title_end, year, kind, season, episode) = match episode_mark {
            Some((at, season, episode)) => {
                // A year before the episode marker still belongs to the
                // title-adjacent metadata, e.g. "Show 2019 S01E02".
                let year = year_at
                    .filter(|&y| y < at)
                    .and_then(|y| parse_year(tokens[y]));
                (at, year, MediaKind::Tv, Some(season), Some(episode))
            }
            None => match year_at {
                Some(y) => (y, parse_year(tokens[y]), MediaKind::Movie, None, None),
                None => (tokens.len(), None, MediaKind::Movie, None, None),
            },
        };

        let title = tokens[..title_end].join(" ");
        if title.is_empty() {
            return Err(ParseError {
                reason: format!("no title recognized in `{stem}`"),
            });
        }

        Ok(ParsedRecord {
            path: path.to_path_buf(),
            title,
            year,
            kind,
            season,
            episode,
        })
    }
}

/// Extract `(season, episode)` from an `SxxEyy` token, already lowercased.
fn parse_episode_token(token: &str) -> Option<(u32, u32)> {
    let rest = token.strip_prefix('s')?;
    let season: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if season.is_empty() {
        return None;
    }
    let episode = rest[season.len()..].strip_prefix('e')?;
    if episode.is_empty() || !episode.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((season.parse().ok()?, episode.parse().ok()?))
}

fn parse_year(token: &str) -> Option<i32> {
    if token.len() != 4 {
        return None;
    }
    let year: i32 = token.parse().ok()?;
    (1900..=2100).contains(&year).then_some(year)
}

/// Terminal status of one pipeline item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchStatus {
    /// The lookup ran; `best` may still be `None` if nothing scored high
    /// enough.
    Completed,
    /// Parsing or the lookup failed for this file.
    Failed { reason: String },
    /// The run was cancelled before this file was processed.
    Cancelled,
}

/// One result per scanned file, whatever happened to it.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub path: PathBuf,
    pub record: Option<ParsedRecord>,
    pub best: Option<MatchCandidate>,
    pub origin: Origin,
    pub status: MatchStatus,
}

impl MatchResult {
    fn cancelled(path: PathBuf, record: Option<ParsedRecord>) -> Self {
        Self {
            path,
            record,
            best: None,
            origin: Origin::None,
            status: MatchStatus::Cancelled,
        }
    }

    fn failed(path: PathBuf, record: Option<ParsedRecord>, reason: String) -> Self {
        Self {
            path,
            record,
            best: None,
            origin: Origin::None,
            status: MatchStatus::Failed { reason },
        }
    }
}

/// Pipeline sizing and file selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Capacity of every inter-stage channel.
    pub queue_capacity: usize,
    pub parser_workers: usize,
    pub match_workers: usize,
    /// File extensions (case-insensitive, no dot) the scanner admits.
    pub extensions: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 2048,
            parser_workers: 4,
            match_workers: 4,
            extensions: ["mkv", "mp4", "avi", "m4v", "mov"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl PipelineConfig {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_workers(mut self, parser: usize, matcher: usize) -> Self {
        self.parser_workers = parser.max(1);
        self.match_workers = matcher.max(1);
        self
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }
}

/// The composed pipeline: scanner, parser pool, match pool.
pub struct ScanParsePipeline {
    config: PipelineConfig,
    parser: Arc<dyn RecordParser>,
    engine: Arc<MatchingEngine>,
}

impl ScanParsePipeline {
    pub fn new(
        config: PipelineConfig,
        parser: Arc<dyn RecordParser>,
        engine: Arc<MatchingEngine>,
    ) -> Self {
        Self {
            config,
            parser,
            engine,
        }
    }

    /// Start the pipeline over `root` and return the bounded result stream.
    ///
    /// The receiver yields exactly one [`MatchResult`] per admitted file
    /// and closes once all stages drain. Dropping the receiver tears the
    /// pipeline down via channel closure.
    pub fn run(
        &self,
        root: impl Into<PathBuf>,
        cancel: CancelToken,
    ) -> Result<mpsc::Receiver<MatchResult>, PipelineError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(PipelineError::InvalidRoot(root));
        }

        let capacity = self.config.queue_capacity;
        let (scan_tx, scan_rx) = mpsc::channel::<ScanTask>(capacity);
        let (parsed_tx, parsed_rx) = mpsc::channel::<ParsedRecord>(capacity);
        let (results_tx, results_rx) = mpsc::channel::<MatchResult>(capacity);

        let extensions = self.config.extensions.clone();
        let scan_cancel = cancel.clone();
        tokio::task::spawn_blocking(move || scan_files(&root, &extensions, &scan_cancel, &scan_tx));

        let scan_rx = Arc::new(Mutex::new(scan_rx));
        for _ in 0..self.config.parser_workers.max(1) {
            tokio::spawn(parse_worker(
                self.parser.clone(),
                scan_rx.clone(),
                parsed_tx.clone(),
                results_tx.clone(),
                cancel.clone(),
            ));
        }
        drop(parsed_tx);

        let parsed_rx = Arc::new(Mutex::new(parsed_rx));
        for _ in 0..self.config.match_workers.max(1) {
            tokio::spawn(match_worker(
                self.engine.clone(),
                parsed_rx.clone(),
                results_tx.clone(),
                cancel.clone(),
            ));
        }

        Ok(results_rx)
    }
}

fn scan_files(
    root: &Path,
    extensions: &[String],
    cancel: &CancelToken,
    tx: &mpsc::Sender<ScanTask>,
) {
    for entry in WalkDir::new(root).follow_links(false) {
        if cancel.is_cancelled() {
            debug!("scan cancelled, stopping walk");
            return;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%err, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let admitted = entry
            .path()
            .extension()
            .and_then(OsStr::to_str)
            .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false);
        if !admitted {
            continue;
        }
        let task = ScanTask {
            path: entry.path().to_path_buf(),
            discovered_at: Utc::now(),
        };
        // Backpressure point: blocks while the parse queue is full.
        if tx.blocking_send(task).is_err() {
            return;
        }
    }
}

async fn parse_worker(
    parser: Arc<dyn RecordParser>,
    scan_rx: Arc<Mutex<mpsc::Receiver<ScanTask>>>,
    parsed_tx: mpsc::Sender<ParsedRecord>,
    results_tx: mpsc::Sender<MatchResult>,
    cancel: CancelToken,
) {
    loop {
        let task = { scan_rx.lock().await.recv().await };
        let Some(task) = task else { break };

        if cancel.is_cancelled() {
            if results_tx
                .send(MatchResult::cancelled(task.path, None))
                .await
                .is_err()
            {
                break;
            }
            continue;
        }

        match parser.parse(&task.path) {
            Ok(record) => {
                if parsed_tx.send(record).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                let result = MatchResult::failed(task.path, None, err.reason);
                if results_tx.send(result).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn match_worker(
    engine: Arc<MatchingEngine>,
    parsed_rx: Arc<Mutex<mpsc::Receiver<ParsedRecord>>>,
    results_tx: mpsc::Sender<MatchResult>,
    cancel: CancelToken,
) {
    loop {
        let record = { parsed_rx.lock().await.recv().await };
        let Some(record) = record else { break };

        let result = if cancel.is_cancelled() {
            MatchResult::cancelled(record.path.clone(), Some(record))
        } else {
            let mut query = MatchQuery::new(record.title.clone(), record.kind)
                .with_year(record.year);
            if let (Some(season), Some(episode)) = (record.season, record.episode) {
                query = query.with_episode(season, episode);
            }
            match engine.find_match(&query).await {
                Ok(outcome) => MatchResult {
                    path: record.path.clone(),
                    best: outcome.best,
                    origin: outcome.origin,
                    record: Some(record),
                    status: MatchStatus::Completed,
                },
                Err(err) => {
                    MatchResult::failed(record.path.clone(), Some(record), err.to_string())
                }
            }
        };

        if results_tx.send(result).await.is_err() {
            break;
        }
    }
}
