use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use trellis_common::keys::validate_tenant;
use trellis_common::{CacheKeyBuilder, CoordResult};

use crate::distributed_cache::DistributedCache;

/// What kind of mutation just completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeClass {
    None,
    MetadataChange,
    DataChange,
}

impl ChangeClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeClass::None => "none",
            ChangeClass::MetadataChange => "metadata-change",
            ChangeClass::DataChange => "data-change",
        }
    }
}

impl fmt::Display for ChangeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChangeClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "none" => Ok(ChangeClass::None),
            "metadata-change" | "metadata" => Ok(ChangeClass::MetadataChange),
            "data-change" | "data" => Ok(ChangeClass::DataChange),
            other => Err(format!("unknown change class: {other}")),
        }
    }
}

/// Outcome of one `invalidate` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationEvent {
    pub tenant_id: String,
    pub change_class: ChangeClass,
    pub namespaces: Vec<String>,
    /// Entries actually deleted. Zero on a repeated call.
    pub removed: u64,
}

fn default_table() -> HashMap<ChangeClass, Vec<String>> {
    let set = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
    HashMap::from([
        (ChangeClass::None, Vec::new()),
        (ChangeClass::MetadataChange, set(&["profile", "board", "columns"])),
        (ChangeClass::DataChange, set(&["answers", "summary", "board"])),
    ])
}

/// Maps each change class to the namespaces it makes stale.
pub struct InvalidationPolicy {
    cache: Arc<DistributedCache>,
    keys: CacheKeyBuilder,
    table: HashMap<ChangeClass, Vec<String>>,
}

impl fmt::Debug for InvalidationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationPolicy")
            .field("table", &self.table)
            .finish()
    }
}

impl InvalidationPolicy {
    pub fn new(cache: Arc<DistributedCache>, keys: CacheKeyBuilder) -> Self {
        Self {
            cache,
            keys,
            table: default_table(),
        }
    }

    /// Replaces the namespaces for one change class.
    pub fn with_namespaces<I, S>(mut self, class: ChangeClass, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.table
            .insert(class, namespaces.into_iter().map(Into::into).collect());
        self
    }

    pub fn namespaces_for(&self, class: ChangeClass) -> &[String] {
        self.table.get(&class).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Deletes every distributed entry of `tenant_id` in the namespaces tied
    /// to `change_class`. Other namespaces and other tenants are untouched.
    pub async fn invalidate(
        &self,
        tenant_id: &str,
        change_class: ChangeClass,
    ) -> CoordResult<InvalidationEvent> {
        validate_tenant(tenant_id)?;

        let mut namespaces = Vec::new();
        let mut removed = 0;
        for namespace in self.namespaces_for(change_class) {
            if self.keys.is_global(namespace) {
                tracing::warn!(namespace = %namespace, "global namespace in invalidation table, skipped");
                continue;
            }
            let prefix = self.keys.namespace_prefix(Some(tenant_id), namespace)?;
            removed += self.cache.remove_prefix(&prefix).await?;
            namespaces.push(namespace.clone());
        }

        tracing::info!(
            tenant_id,
            change_class = %change_class,
            namespaces = ?namespaces,
            removed,
            "cache invalidated"
        );

        Ok(InvalidationEvent {
            tenant_id: tenant_id.to_string(),
            change_class,
            namespaces,
            removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use trellis_common::CoordError;
    use trellis_meta::MemoryMetaStore;

    use super::*;

    async fn seeded() -> (Arc<DistributedCache>, InvalidationPolicy) {
        let cache = Arc::new(DistributedCache::new(
            Arc::new(MemoryMetaStore::new()),
            Duration::from_secs(10),
        ));
        let keys = CacheKeyBuilder::new();
        for tenant in ["t1", "t2"] {
            for ns in ["profile", "answers", "summary", "columns", "board"] {
                let key = keys.build_key(Some(tenant), ns, "x").unwrap();
                cache.set(&key, &format!("{tenant}/{ns}"), 600).await.unwrap();
            }
        }
        let policy = InvalidationPolicy::new(Arc::clone(&cache), keys);
        (cache, policy)
    }

    async fn present(cache: &DistributedCache, tenant: &str, ns: &str) -> bool {
        let key = CacheKeyBuilder::new().build_key(Some(tenant), ns, "x").unwrap();
        cache.get::<String>(&key).await.unwrap().is_some()
    }

    #[tokio::test]
    async fn test_metadata_change_clears_only_metadata() {
        let (cache, policy) = seeded().await;
        let event = policy.invalidate("t1", ChangeClass::MetadataChange).await.unwrap();
        assert_eq!(event.removed, 3);

        assert!(!present(&cache, "t1", "profile").await);
        assert!(!present(&cache, "t1", "columns").await);
        assert!(!present(&cache, "t1", "board").await);
        assert!(present(&cache, "t1", "answers").await);
        assert!(present(&cache, "t1", "summary").await);
    }

    #[tokio::test]
    async fn test_data_change_clears_answers() {
        let (cache, policy) = seeded().await;
        policy.invalidate("t1", ChangeClass::DataChange).await.unwrap();
        assert!(!present(&cache, "t1", "answers").await);
        assert!(!present(&cache, "t1", "summary").await);
        assert!(present(&cache, "t1", "profile").await);
    }

    #[tokio::test]
    async fn test_invalidation_is_idempotent_and_tenant_scoped() {
        let (cache, policy) = seeded().await;
        let first = policy.invalidate("t1", ChangeClass::DataChange).await.unwrap();
        let second = policy.invalidate("t1", ChangeClass::DataChange).await.unwrap();
        assert_eq!(first.removed, 3);
        assert_eq!(second.removed, 0);
        assert_eq!(first.namespaces, second.namespaces);

        for ns in ["profile", "answers", "summary", "columns", "board"] {
            assert!(present(&cache, "t2", ns).await, "t2 {ns} was cleared");
        }
    }

    #[tokio::test]
    async fn test_none_clears_nothing() {
        let (cache, policy) = seeded().await;
        let event = policy.invalidate("t1", ChangeClass::None).await.unwrap();
        assert_eq!(event.removed, 0);
        assert!(event.namespaces.is_empty());
        assert!(present(&cache, "t1", "profile").await);
    }

    #[tokio::test]
    async fn test_custom_table_and_bad_tenant() {
        let (cache, policy) = seeded().await;
        let policy = policy.with_namespaces(ChangeClass::None, ["summary"]);
        policy.invalidate("t1", ChangeClass::None).await.unwrap();
        assert!(!present(&cache, "t1", "summary").await);

        let err = policy.invalidate("", ChangeClass::DataChange).await.unwrap_err();
        assert!(matches!(err, CoordError::InvalidScope(_)));
    }

    #[test]
    fn test_parse_change_class() {
        assert_eq!("metadata-change".parse(), Ok(ChangeClass::MetadataChange));
        assert_eq!("DATA_CHANGE".parse(), Ok(ChangeClass::DataChange));
        assert!("everything".parse::<ChangeClass>().is_err());
    }
}
