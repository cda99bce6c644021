//! Durable file-backed cache store.
//!
//! One JSON file per entry, named by the SHA-256 of the key, under a single
//! root directory. Writes go through a temp file, fsync, and an atomic
//! rename, so a crash mid-write never exposes a torn entry. Corrupted files
//! are moved into a `quarantine/` subdirectory (kept for post-mortem, never
//! deleted) and read as a miss.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::entry::{hash_key, migrate_entry, CacheEntry, CacheKind};
use crate::error::CacheError;

const QUARANTINE_DIR: &str = "quarantine";

/// Field names that must never be persisted. A payload carrying any of
/// these at any nesting depth is refused outright.
const CREDENTIAL_FIELDS: &[&str] = &[
    "api_key",
    "apikey",
    "token",
    "access_token",
    "secret",
    "password",
    "authorization",
];

/// Configuration for the cache store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Byte budget; exceeding it triggers LRU eviction.
    pub max_bytes: u64,
    /// TTL applied by callers that do not specify one. `None` = no expiry.
    pub default_ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            default_ttl: Some(Duration::from_secs(7 * 24 * 3600)),
        }
    }
}

impl CacheConfig {
    pub fn with_max_bytes(mut self, bytes: u64) -> Self {
        self.max_bytes = bytes;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }
}

#[derive(Debug, Clone)]
struct IndexMeta {
    key: String,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    last_accessed_at: DateTime<Utc>,
    size_bytes: u64,
}

/// Persistent key/value store with TTL expiry, LRU byte-budget eviction,
/// and corruption quarantine.
///
/// Concurrency: many readers, last writer wins per key. The in-memory index
/// is a [`DashMap`]; durability comes from the per-entry files themselves.
pub struct CacheStore {
    root: PathBuf,
    config: CacheConfig,
    index: DashMap<String, IndexMeta>,
    total_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    quarantined: AtomicU64,
}

impl CacheStore {
    /// Open (or create) a store rooted at `root`, rebuilding the index from
    /// the entry files found there. Stale-schema entries are migrated and
    /// rewritten; unreadable ones are quarantined.
    pub fn open(root: impl Into<PathBuf>, config: CacheConfig) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(root.join(QUARANTINE_DIR))?;

        let store = Self {
            root,
            config,
            index: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            quarantined: AtomicU64::new(0),
        };
        store.load_index()?;
        Ok(store)
    }

    fn load_index(&self) -> Result<(), CacheError> {
        for dirent in fs::read_dir(&self.root)? {
            let dirent = dirent?;
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let raw = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(?path, %err, "unreadable cache file; quarantining");
                    self.quarantine_file(&path);
                    continue;
                }
            };

            let doc: Value = match serde_json::from_slice(&raw) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(?path, %err, "corrupted cache file; quarantining");
                    self.quarantine_file(&path);
                    continue;
                }
            };

            let had_old_schema = doc
                .get("schema_version")
                .and_then(Value::as_u64)
                .map(|v| v as u32 != super::entry::SCHEMA_VERSION)
                .unwrap_or(true);

            match migrate_entry(doc) {
                Some(entry) => {
                    if had_old_schema {
                        debug!(key = %entry.key, "migrated cache entry to current schema");
                        if let Err(err) = self.persist(&entry) {
                            warn!(key = %entry.key, %err, "failed to rewrite migrated entry");
                        }
                    }
                    self.index_insert(&entry);
                }
                None => {
                    debug!(?path, "cache entry has no defined migration; discarding");
                    let _ = fs::remove_file(&path);
                }
            }
        }
        Ok(())
    }

    /// Look up a key. Returns `None` on miss, expiry, or corruption; a read
    /// never fails the caller. Hits update `hit_count` and
    /// `last_accessed_at`, durably.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let hash = hash_key(key);
        if !self.index.contains_key(&hash) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let path = self.entry_path(&hash);
        let raw = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(%key, %err, "indexed cache file unreadable; treating as miss");
                self.index_remove(&hash);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let mut entry = match serde_json::from_slice::<Value>(&raw)
            .ok()
            .and_then(migrate_entry)
        {
            Some(entry) => entry,
            None => {
                warn!(%key, "corrupted cache entry; quarantining and missing");
                self.index_remove(&hash);
                self.quarantine_file(&path);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if entry.is_expired(Utc::now()) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        entry.hit_count += 1;
        entry.last_accessed_at = Utc::now();
        // Access metadata is persisted so LRU order survives restarts; a
        // failed rewrite degrades to stale metadata, not a failed read.
        if let Err(err) = self.persist(&entry) {
            warn!(%key, %err, "failed to persist access metadata");
        }
        self.index_insert(&entry);

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Insert or overwrite an entry. `ttl: None` means the entry never
    /// expires. Payloads containing credential-like fields are refused.
    pub fn put(
        &self,
        key: &str,
        kind: CacheKind,
        payload: Value,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        if let Some(field) = find_credential_field(&payload) {
            return Err(CacheError::CredentialGuard { field });
        }

        let entry = CacheEntry::new(key, kind, payload, ttl);
        self.persist(&entry)?;
        self.index_insert(&entry);
        self.evict_to_budget(self.config.max_bytes);
        Ok(())
    }

    /// Remove an entry. Returns whether anything was removed.
    pub fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let hash = hash_key(key);
        let existed = self.index_remove(&hash);
        match fs::remove_file(self.entry_path(&hash)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(existed),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove every entry past its expiry. Idempotent; safe alongside
    /// concurrent reads and writes. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .index
            .iter()
            .filter(|item| matches!(item.value().expires_at, Some(at) if at <= now))
            .map(|item| item.key().clone())
            .collect();

        let mut removed = 0;
        for hash in expired {
            if self.index_remove(&hash) {
                let _ = fs::remove_file(self.entry_path(&hash));
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "purged expired cache entries");
        }
        removed
    }

    /// Evict least-recently-used entries until cumulative size fits the
    /// budget. Ties on `last_accessed_at` break toward the older
    /// `created_at`. Returns the number evicted.
    pub fn evict_to_budget(&self, max_bytes: u64) -> usize {
        let mut evicted = 0;
        while self.total_bytes.load(Ordering::Relaxed) > max_bytes {
            let victim = self
                .index
                .iter()
                .min_by_key(|item| (item.value().last_accessed_at, item.value().created_at))
                .map(|item| item.key().clone());

            match victim {
                Some(hash) => {
                    if self.index_remove(&hash) {
                        let _ = fs::remove_file(self.entry_path(&hash));
                        evicted += 1;
                    }
                }
                None => break,
            }
        }
        if evicted > 0 {
            debug!(evicted, "evicted cache entries to byte budget");
        }
        evicted
    }

    /// Snapshot of store statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.index.len(),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            quarantined: self.quarantined.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn entry_path(&self, hash: &str) -> PathBuf {
        self.root.join(format!("{hash}.json"))
    }

    fn persist(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec_pretty(entry)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        let path = self.entry_path(&entry.key_hash);
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn index_insert(&self, entry: &CacheEntry) {
        let meta = IndexMeta {
            key: entry.key.clone(),
            created_at: entry.created_at,
            expires_at: entry.expires_at,
            last_accessed_at: entry.last_accessed_at,
            size_bytes: entry.size_bytes,
        };
        if let Some(old) = self.index.insert(entry.key_hash.clone(), meta) {
            self.total_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(entry.size_bytes, Ordering::Relaxed);
    }

    fn index_remove(&self, hash: &str) -> bool {
        if let Some((_, meta)) = self.index.remove(hash) {
            self.total_bytes.fetch_sub(meta.size_bytes, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn quarantine_file(&self, path: &Path) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let stamp = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let dest = self.root.join(QUARANTINE_DIR).join(format!("{stamp}-{name}"));
        match fs::rename(path, &dest) {
            Ok(()) => {
                self.quarantined.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => warn!(?path, %err, "failed to quarantine cache file"),
        }
    }
}

/// Statistics snapshot for the cache store.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub quarantined: u64,
}

/// Depth-first scan for credential-like field names.
fn find_credential_field(payload: &Value) -> Option<String> {
    match payload {
        Value::Object(map) => {
            for (field, value) in map {
                if CREDENTIAL_FIELDS.contains(&field.to_ascii_lowercase().as_str()) {
                    return Some(field.clone());
                }
                if let Some(found) = find_credential_field(value) {
                    return Some(found);
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(find_credential_field),
        _ => None,
    }
}
