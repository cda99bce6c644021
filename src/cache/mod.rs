//! Persistent cache layer: the fast path for repeated lookups and the
//! fallback data source when the API is unreachable.

pub mod entry;
pub mod store;

pub use entry::{hash_key, migrate_entry, CacheEntry, CacheKind, SCHEMA_VERSION};
pub use store::{CacheConfig, CacheStats, CacheStore};
