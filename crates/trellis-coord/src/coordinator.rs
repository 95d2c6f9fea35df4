use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use trellis_common::{
    CacheKeyBuilder, CoordConfig, CoordError, CoordResult, ExecutionContext, ExecutionSummary,
    OperationClass,
};
use trellis_meta::MetaStore;

use crate::distributed_cache::{CacheStats, DistributedCache};
use crate::handle::{RemoteStoreConnector, ServiceHandle, ServiceHandleProvider};
use crate::invalidation::{ChangeClass, InvalidationEvent, InvalidationPolicy};
use crate::lock::{LockCoordinator, LockStats};

/// One instance of every shared component, built from a single config and
/// passed explicitly to whoever serves requests.
#[derive(Debug)]
pub struct Coordinator {
    config: CoordConfig,
    keys: CacheKeyBuilder,
    cache: Arc<DistributedCache>,
    locks: Arc<LockCoordinator>,
    handles: ServiceHandleProvider,
    invalidation: InvalidationPolicy,
}

impl Coordinator {
    pub fn new(
        config: CoordConfig,
        store: Arc<dyn MetaStore>,
        connector: Arc<dyn RemoteStoreConnector>,
    ) -> Self {
        let keys = CacheKeyBuilder::with_global_namespaces(config.global_namespaces.iter().cloned());
        let cache = Arc::new(DistributedCache::new(store, config.stampede_wait));
        let locks = Arc::new(LockCoordinator::new(config.lock_timeouts, config.lock_lease));
        let handles = ServiceHandleProvider::new(
            connector,
            config.handle_ttl,
            config.handle_max_attempts,
            config.handle_retry_delay,
        );
        let invalidation = InvalidationPolicy::new(Arc::clone(&cache), keys.clone());

        Self {
            config,
            keys,
            cache,
            locks,
            handles,
            invalidation,
        }
    }

    /// Swaps the invalidation table, e.g. to add product-specific namespaces.
    pub fn with_invalidation(mut self, f: impl FnOnce(InvalidationPolicy) -> InvalidationPolicy) -> Self {
        self.invalidation = f(self.invalidation);
        self
    }

    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    pub fn keys(&self) -> &CacheKeyBuilder {
        &self.keys
    }

    pub fn cache(&self) -> &Arc<DistributedCache> {
        &self.cache
    }

    pub fn locks(&self) -> &Arc<LockCoordinator> {
        &self.locks
    }

    pub fn handles(&self) -> &ServiceHandleProvider {
        &self.handles
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn lock_stats(&self) -> LockStats {
        self.locks.stats()
    }

    /// Starts a request execution. The returned context is owned by the
    /// request orchestrator and must be handed back to
    /// [`Coordinator::clear_execution_scope`] at the end.
    pub fn begin_execution(
        &self,
        request_id: impl Into<String>,
        tenant_id: Option<&str>,
    ) -> ExecutionContext {
        let ctx = ExecutionContext::new(request_id, tenant_id.map(str::to_string));
        tracing::debug!(
            request_id = ctx.request_id(),
            tenant_id = tenant_id.unwrap_or("-"),
            "execution started"
        );
        ctx
    }

    /// Lock resource key for a tenant-owned entity.
    pub fn resource_key(&self, tenant_id: &str, entity: &str) -> CoordResult<String> {
        self.keys.resource_key(tenant_id, entity)
    }

    /// Runs `body` under the lock on `resource_key`, held on behalf of the
    /// execution's request id. A second acquisition of the same key from the
    /// same execution fails with `LockReentry`.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        ctx: &ExecutionContext,
        resource_key: &str,
        class: OperationClass,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CoordError>,
    {
        self.locks
            .with_lock(ctx.request_id(), resource_key, class, body)
            .await
    }

    /// Reads `{tenant}:{namespace}:{identifier}` from the distributed cache,
    /// computing and storing it on a miss.
    pub async fn get_cached<T, F, Fut>(
        &self,
        tenant_id: Option<&str>,
        namespace: &str,
        identifier: &str,
        ttl_seconds: u64,
        factory: F,
    ) -> CoordResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let key = self.keys.build_key(tenant_id, namespace, identifier)?;
        self.cache.get_or_compute(&key, ttl_seconds, factory).await
    }

    pub async fn get_service_handle(
        &self,
        ctx: &mut ExecutionContext,
        tenant_id: &str,
    ) -> CoordResult<Arc<ServiceHandle>> {
        self.handles.get_handle(ctx, tenant_id).await
    }

    /// Call after a successful mutation; never clear caches directly.
    pub async fn invalidate(
        &self,
        tenant_id: &str,
        change_class: ChangeClass,
    ) -> CoordResult<InvalidationEvent> {
        self.invalidation.invalidate(tenant_id, change_class).await
    }

    /// Ends the execution and drops everything it memoized.
    pub fn clear_execution_scope(&self, ctx: ExecutionContext) -> ExecutionSummary {
        ctx.finish()
    }
}
