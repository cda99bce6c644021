//! Cache entry record and schema versioning.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Current on-disk schema version. Bump when the entry layout changes and
/// teach [`migrate_entry`] how to read the old shape.
pub const SCHEMA_VERSION: u32 = 2;

/// What kind of lookup produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    Search,
    Details,
}

/// One durable cache record.
///
/// Invariant: `expires_at` is either `None` (never expires) or strictly
/// greater than `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub schema_version: u32,
    pub key: String,
    /// SHA-256 of `key`, hex-encoded; doubles as the on-disk file name.
    pub key_hash: String,
    pub kind: CacheKind,
    /// The cached API response body.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    /// `None` means the entry never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub hit_count: u64,
    pub last_accessed_at: DateTime<Utc>,
    /// Serialized payload size; the unit of the store's byte budget.
    pub size_bytes: u64,
}

impl CacheEntry {
    pub fn new(key: &str, kind: CacheKind, payload: Value, ttl: Option<Duration>) -> Self {
        let now = Utc::now();
        // A zero ttl still yields expires_at > created_at, per the entry
        // invariant.
        let expires_at = ttl.and_then(|d| {
            ChronoDuration::from_std(d)
                .ok()
                .map(|delta| now + delta.max(ChronoDuration::milliseconds(1)))
        });
        let size_bytes = payload_size(&payload);
        Self {
            schema_version: SCHEMA_VERSION,
            key: key.to_string(),
            key_hash: hash_key(key),
            kind,
            payload,
            created_at: now,
            expires_at,
            hit_count: 0,
            last_accessed_at: now,
            size_bytes,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => at <= now,
            None => false,
        }
    }
}

/// SHA-256 hex digest of a cache key.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn payload_size(payload: &Value) -> u64 {
    serde_json::to_vec(payload).map(|v| v.len() as u64).unwrap_or(0)
}

/// Interpret a raw JSON document as a cache entry, migrating older schema
/// versions in place.
///
/// Returns `None` when the document is from a version with no defined
/// migration; such entries are discarded rather than misread.
pub fn migrate_entry(doc: Value) -> Option<CacheEntry> {
    let version = doc
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32;

    match version {
        SCHEMA_VERSION => serde_json::from_value(doc).ok(),
        1 => migrate_v1(doc),
        _ => None,
    }
}

/// Version 1 entries predate the `kind` and `size_bytes` fields. The kind is
/// recovered from the key prefix; the size is recomputed from the payload.
fn migrate_v1(doc: Value) -> Option<CacheEntry> {
    let obj = doc.as_object()?;
    let key = obj.get("key")?.as_str()?.to_string();
    let payload = obj.get("payload")?.clone();
    let created_at: DateTime<Utc> =
        serde_json::from_value(obj.get("created_at")?.clone()).ok()?;
    let expires_at: Option<DateTime<Utc>> = match obj.get("expires_at") {
        Some(Value::Null) | None => None,
        Some(v) => Some(serde_json::from_value(v.clone()).ok()?),
    };
    let hit_count = obj.get("hit_count").and_then(Value::as_u64).unwrap_or(0);
    let last_accessed_at: DateTime<Utc> = obj
        .get("last_accessed_at")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or(created_at);

    let kind = if key.starts_with("details:") {
        CacheKind::Details
    } else {
        CacheKind::Search
    };

    Some(CacheEntry {
        schema_version: SCHEMA_VERSION,
        key_hash: hash_key(&key),
        size_bytes: payload_size(&payload),
        key,
        kind,
        payload,
        created_at,
        expires_at,
        hit_count,
        last_accessed_at,
    })
}
