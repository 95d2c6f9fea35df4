use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Process-local memo cache scoped to one request execution.
///
/// Values are moved in and shared back out as `Arc`s; nothing is serialized,
/// so handles carrying callables are safe here. Clearing is reserved for the
/// owner of the [`ExecutionContext`] at teardown.
#[derive(Default)]
pub struct ExecutionCache {
    entries: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ExecutionCache {
    /// Returns the value under `key` if present and of type `T`.
    pub fn get<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.entries
            .get(key)
            .and_then(|v| Arc::clone(v).downcast::<T>().ok())
    }

    pub fn set<T>(&mut self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.set_shared(key, Arc::new(value));
    }

    pub fn set_shared<T>(&mut self, key: impl Into<String>, value: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        self.entries.insert(key.into(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }
}

impl fmt::Debug for ExecutionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionCache")
            .field("keys", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// State owned by a single inbound request execution.
///
/// Deliberately neither `Clone` nor serializable: it is handed to handlers by
/// `&mut` and torn down exactly once by [`ExecutionContext::finish`].
#[derive(Debug)]
pub struct ExecutionContext {
    request_id: String,
    tenant_id: Option<String>,
    started_at: Instant,
    cache: ExecutionCache,
}

/// What a finished execution left behind, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub elapsed: Duration,
    pub cleared_entries: usize,
}

impl ExecutionContext {
    pub fn new(request_id: impl Into<String>, tenant_id: Option<String>) -> Self {
        Self {
            request_id: request_id.into(),
            tenant_id,
            started_at: Instant::now(),
            cache: ExecutionCache::default(),
        }
    }

    /// Context with a random request id.
    pub fn generate(tenant_id: Option<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), tenant_id)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn cache(&self) -> &ExecutionCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ExecutionCache {
        &mut self.cache
    }

    /// Request teardown. Consumes the context, so the execution cache is
    /// cleared once and only by whoever owns the execution.
    pub fn finish(mut self) -> ExecutionSummary {
        let cleared_entries = self.cache.clear();
        let summary = ExecutionSummary {
            elapsed: self.started_at.elapsed(),
            cleared_entries,
        };
        tracing::debug!(
            request_id = %self.request_id,
            tenant_id = self.tenant_id.as_deref().unwrap_or("-"),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            cleared_entries,
            "execution finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Callback {
        name: &'static str,
        call: Box<dyn Fn(u32) -> u32 + Send + Sync>,
    }

    #[test]
    fn test_stores_callables_without_serializing() {
        let mut ctx = ExecutionContext::new("req-1", Some("t1".into()));
        ctx.cache_mut().set(
            "handle",
            Callback {
                name: "double",
                call: Box::new(|x| x * 2),
            },
        );

        let cb = ctx.cache().get::<Callback>("handle").unwrap();
        assert_eq!(cb.name, "double");
        assert_eq!((cb.call)(21), 42);
    }

    #[test]
    fn test_get_with_wrong_type_is_none() {
        let mut cache = ExecutionCache::default();
        cache.set("n", 7u32);
        assert!(cache.get::<String>("n").is_none());
        assert_eq!(*cache.get::<u32>("n").unwrap(), 7);
        assert!(cache.get::<u32>("missing").is_none());
    }

    #[test]
    fn test_shared_value_is_same_allocation() {
        let mut cache = ExecutionCache::default();
        let v = Arc::new(String::from("x"));
        cache.set_shared("k", Arc::clone(&v));
        assert!(Arc::ptr_eq(&v, &cache.get::<String>("k").unwrap()));
    }

    #[test]
    fn test_finish_clears_once() {
        let mut ctx = ExecutionContext::generate(None);
        ctx.cache_mut().set("a", 1u8);
        ctx.cache_mut().set("b", 2u8);
        assert_eq!(ctx.cache().len(), 2);
        assert!(!ctx.request_id().is_empty());

        let summary = ctx.finish();
        assert_eq!(summary.cleared_entries, 2);
    }
}
