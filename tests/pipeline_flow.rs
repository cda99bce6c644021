//! Full scan/parse/match runs through the composed pipeline.

mod common;

use common::EchoApi;
use metamatch::{build_pipeline, CancelToken, CoreConfig, MatchResult, MatchStatus, Origin};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn seed_library(root: &Path) -> usize {
    let shows = root.join("shows");
    let movies = root.join("movies");
    fs::create_dir_all(&shows).unwrap();
    fs::create_dir_all(&movies).unwrap();

    fs::write(shows.join("The.Example.Show.S01E01.1080p.mkv"), b"").unwrap();
    fs::write(shows.join("The.Example.Show.S01E02.1080p.mkv"), b"").unwrap();
    fs::write(movies.join("Dune.2021.2160p.mkv"), b"").unwrap();
    fs::write(movies.join("Arrival.2016.mp4"), b"").unwrap();
    // Not admitted: wrong extensions.
    fs::write(movies.join("poster.jpg"), b"").unwrap();
    fs::write(root.join("README.txt"), b"").unwrap();

    4
}

async fn collect(mut rx: tokio::sync::mpsc::Receiver<MatchResult>) -> Vec<MatchResult> {
    let mut results = Vec::new();
    while let Some(result) = rx.recv().await {
        results.push(result);
    }
    results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_run_produces_one_result_per_admitted_file() {
    let media = tempdir().unwrap();
    let cache = tempdir().unwrap();
    let expected = seed_library(media.path());

    let api = EchoApi::new();
    let config = CoreConfig::default();
    let pipeline = build_pipeline(&config, api.clone(), cache.path()).unwrap();

    let results = collect(pipeline.run(media.path(), CancelToken::new()).unwrap()).await;

    assert_eq!(results.len(), expected);
    for result in &results {
        assert_eq!(result.status, MatchStatus::Completed);
        let best = result.best.as_ref().expect("echo transport always matches");
        assert!(best.confidence >= config.matcher.high_confidence);
        assert!(result.record.is_some());
    }
    // The two episode files carry their parsed season/episode numbers.
    let episodes = results
        .iter()
        .filter_map(|r| r.record.as_ref())
        .filter(|rec| rec.season == Some(1) && rec.episode.is_some())
        .count();
    assert_eq!(episodes, 2);
    assert!(api.calls() > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_run_is_served_entirely_from_cache() {
    let media = tempdir().unwrap();
    let cache = tempdir().unwrap();
    seed_library(media.path());

    let api = EchoApi::new();
    let config = CoreConfig::default();

    let first_pipeline = build_pipeline(&config, api.clone(), cache.path()).unwrap();
    let first = collect(first_pipeline.run(media.path(), CancelToken::new()).unwrap()).await;
    assert!(first.iter().all(|r| r.status == MatchStatus::Completed));
    let calls_after_first = api.calls();
    assert!(calls_after_first > 0);

    // Fresh pipeline, same cache directory: every lookup hits the store.
    let second_pipeline = build_pipeline(&config, api.clone(), cache.path()).unwrap();
    let second = collect(second_pipeline.run(media.path(), CancelToken::new()).unwrap()).await;

    assert_eq!(second.len(), first.len());
    assert!(second
        .iter()
        .all(|r| r.status == MatchStatus::Completed && r.origin == Origin::Cache));
    assert_eq!(api.calls(), calls_after_first);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unparseable_files_are_reported_not_dropped() {
    let media = tempdir().unwrap();
    let cache = tempdir().unwrap();
    fs::write(media.path().join("....mkv"), b"").unwrap();
    fs::write(media.path().join("Dune.2021.mkv"), b"").unwrap();

    let pipeline = build_pipeline(&CoreConfig::default(), EchoApi::new(), cache.path()).unwrap();
    let results = collect(pipeline.run(media.path(), CancelToken::new()).unwrap()).await;

    assert_eq!(results.len(), 2);
    let failed: Vec<_> = results
        .iter()
        .filter(|r| matches!(r.status, MatchStatus::Failed { .. }))
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].record.is_none());
    assert_eq!(failed[0].origin, Origin::None);
}
