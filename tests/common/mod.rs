#![allow(dead_code)]

//! Shared test transport: a scripted metadata API that replays programmed
//! responses and counts every call that reaches it.

use async_trait::async_trait;
use metamatch::{ApiError, MetadataApi, SearchQuery};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub struct ScriptedApi {
    script: Mutex<VecDeque<Result<Value, ApiError>>>,
    fallback: Option<Value>,
    calls: AtomicU64,
}

impl ScriptedApi {
    /// Replays `script` in order, then errors with 500s.
    pub fn new(script: Vec<Result<Value, ApiError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback: None,
            calls: AtomicU64::new(0),
        })
    }

    /// Echoes `fallback` forever once the script is exhausted.
    pub fn with_fallback(fallback: Value) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(fallback),
            calls: AtomicU64::new(0),
        })
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(&self) -> Result<Value, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.script.lock().unwrap().pop_front() {
            return scripted;
        }
        match &self.fallback {
            Some(value) => Ok(value.clone()),
            None => Err(ApiError::Server(500)),
        }
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

/// Transport that answers every search with a perfect-title candidate.
pub struct EchoApi {
    calls: AtomicU64,
}

impl EchoApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU64::new(0),
        })
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataApi for EchoApi {
    async fn search(&self, query: &SearchQuery) -> Result<Value, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"results": [
            {"id": 1, "title": query.title, "media_type": query.kind.as_str()},
        ]}))
    }

    async fn details(&self, _id: &str) -> Result<Value, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({}))
    }
}

/// A minimal search response with one result row.
pub fn search_payload(id: u64, title: &str, year: i32, media_type: &str) -> Value {
    json!({"results": [
        {"id": id, "title": title, "year": year, "media_type": media_type},
    ]})
}
