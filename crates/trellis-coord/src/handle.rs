use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::time::Instant;

use trellis_common::keys::validate_tenant;
use trellis_common::{CoordError, CoordResult, ExecutionContext, KEY_SEPARATOR};

/// Capabilities every handle must expose before it is handed out.
pub const DEFAULT_REQUIRED_CAPABILITIES: [&str; 5] = [
    "open_sheet",
    "read_range",
    "write_range",
    "append_rows",
    "clear_range",
];

/// One callable operation on the remote store.
#[derive(Clone)]
pub struct Capability(Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>);

impl Capability {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self(Arc::new(move |args| f(args).boxed()))
    }

    pub async fn call(&self, args: Value) -> anyhow::Result<Value> {
        (self.0)(args).await
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Capability(<fn>)")
    }
}

impl Serialize for Capability {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom(
            "callable members cannot be serialized",
        ))
    }
}

/// Capabilities as reported by a connector. An entry may be present by name
/// but not callable, which is how a corrupted client looks.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    entries: BTreeMap<String, Option<Capability>>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, capability: Capability) -> Self {
        self.entries.insert(name.into(), Some(capability));
        self
    }

    /// Records `name` as present but without a callable body.
    pub fn with_stripped(mut self, name: impl Into<String>) -> Self {
        self.entries.insert(name.into(), None);
        self
    }

    /// The callable under `name`, if present and not stripped.
    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.entries.get(name).and_then(Option::as_ref)
    }

    /// Required names that are absent or not callable.
    fn unusable<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .filter(|name| !matches!(self.entries.get(name.as_str()), Some(Some(_))))
            .map(String::as_str)
            .collect()
    }
}

/// Builds raw capability sets for a tenant. Implemented by the remote store
/// client adapter.
#[async_trait]
pub trait RemoteStoreConnector: Send + Sync {
    async fn connect(&self, tenant_id: &str) -> anyhow::Result<CapabilitySet>;
}

/// A verified accessor to the remote store for one tenant. Lives only in the
/// execution cache: it is not `Serialize`.
pub struct ServiceHandle {
    tenant_id: String,
    generation: u64,
    created_at: Instant,
    capabilities: BTreeMap<String, Option<Capability>>,
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("tenant_id", &self.tenant_id)
            .field("generation", &self.generation)
            .field("capabilities", &self.capabilities.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ServiceHandle {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_callable(&self, name: &str) -> bool {
        matches!(self.capabilities.get(name), Some(Some(_)))
    }

    pub async fn invoke(&self, name: &str, args: Value) -> anyhow::Result<Value> {
        match self.capabilities.get(name) {
            Some(Some(cap)) => cap.call(args).await,
            Some(None) => anyhow::bail!("capability {name} is present but not callable"),
            None => anyhow::bail!("unknown capability {name}"),
        }
    }
}

/// Hands out verified service handles, memoized per execution.
pub struct ServiceHandleProvider {
    connector: Arc<dyn RemoteStoreConnector>,
    required: Vec<String>,
    ttl: Duration,
    max_attempts: u32,
    retry_delay: Duration,
    generation: AtomicU64,
}

impl fmt::Debug for ServiceHandleProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandleProvider")
            .field("required", &self.required)
            .field("ttl", &self.ttl)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl ServiceHandleProvider {
    pub fn new(
        connector: Arc<dyn RemoteStoreConnector>,
        ttl: Duration,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            connector,
            required: DEFAULT_REQUIRED_CAPABILITIES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ttl,
            max_attempts: max_attempts.max(1),
            retry_delay,
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_required_capabilities<I, S>(mut self, required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required = required.into_iter().map(Into::into).collect();
        self
    }

    /// Handles built so far by this provider.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    pub async fn get_handle(
        &self,
        ctx: &mut ExecutionContext,
        tenant_id: &str,
    ) -> CoordResult<Arc<ServiceHandle>> {
        validate_tenant(tenant_id)?;
        let slot = format!("service_handle{KEY_SEPARATOR}{tenant_id}");

        if let Some(handle) = ctx.cache().get::<ServiceHandle>(&slot) {
            if handle.age() < self.ttl {
                return Ok(handle);
            }
            tracing::debug!(
                tenant_id,
                generation = handle.generation,
                age_ms = handle.age().as_millis() as u64,
                "service handle expired, rebuilding"
            );
        }

        let handle = Arc::new(self.build(tenant_id).await?);
        ctx.cache_mut().set_shared(slot, Arc::clone(&handle));
        Ok(handle)
    }

    async fn build(&self, tenant_id: &str) -> CoordResult<ServiceHandle> {
        let mut reason = String::new();

        for attempt in 1..=self.max_attempts {
            match self.connector.connect(tenant_id).await {
                Ok(set) => {
                    let unusable = set.unusable(&self.required);
                    if unusable.is_empty() {
                        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::debug!(tenant_id, generation, attempt, "service handle verified");
                        return Ok(ServiceHandle {
                            tenant_id: tenant_id.to_string(),
                            generation,
                            created_at: Instant::now(),
                            capabilities: set.entries,
                        });
                    }
                    reason = format!("missing or non-callable capabilities: {}", unusable.join(", "));
                }
                Err(e) => reason = format!("connect failed: {e:#}"),
            }

            tracing::warn!(
                tenant_id,
                attempt,
                max_attempts = self.max_attempts,
                reason = %reason,
                "service handle verification failed"
            );
            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(CoordError::ServiceHandleIntegrity {
            tenant_id: tenant_id.to_string(),
            attempts: self.max_attempts,
            reason,
        })
    }
}
