use anyhow::Result;
use async_trait::async_trait;

/// Shared byte-oriented key/value store backing the cross-execution cache.
///
/// Keys are plain strings; prefix operations match on raw string prefixes, so
/// callers that want namespace isolation must terminate prefixes with a
/// separator.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Store `value` under `key`. With `ttl_ms`, the entry disappears once the
    /// TTL elapses. Returns the new revision.
    async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<u64>;
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>>;
    /// Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool>;
    /// Removes every live entry under `prefix`; returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;
}
