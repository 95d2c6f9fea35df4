use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::types::MetaStore;

/// In-process `MetaStore`. Shared by cloning; all clones see the same data.
///
/// TTLs are enforced lazily: expired entries are invisible to reads and are
/// purged by the next write that touches them.
#[derive(Debug, Clone)]
pub struct MemoryMetaStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, Entry>,
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    revision: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    fn next_revision(inner: &mut Inner) -> u64 {
        inner.revision = inner.revision.saturating_add(1);
        inner.revision
    }

    /// Number of live entries. Mostly useful for tests and the drill report.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let inner = self.inner.read().await;
        inner.kv.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<u64> {
        let expires_at = ttl_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut inner = self.inner.write().await;
        let revision = Self::next_revision(&mut inner);
        inner.kv.insert(
            key.to_string(),
            Entry {
                value,
                revision,
                expires_at,
            },
        );
        Ok(revision)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let now = Instant::now();
        let inner = self.inner.read().await;
        Ok(inner
            .kv
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| (e.value.clone(), e.revision)))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let removed = inner.kv.remove(key);
        if removed.is_some() {
            Self::next_revision(&mut inner);
        }
        Ok(removed.map(|e| e.is_live(now)).unwrap_or(false))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let keys: Vec<String> = inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();

        let mut live = 0u64;
        for key in &keys {
            if let Some(entry) = inner.kv.remove(key) {
                if entry.is_live(now) {
                    live += 1;
                }
            }
        }
        if !keys.is_empty() {
            Self::next_revision(&mut inner);
        }
        Ok(live)
    }
}
