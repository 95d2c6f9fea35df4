pub mod coordinator;
pub mod distributed_cache;
pub mod handle;
pub mod invalidation;
pub mod lock;
pub mod retry;

pub use coordinator::Coordinator;
pub use distributed_cache::{CacheEntry, CacheStats, DistributedCache};
pub use handle::{Capability, CapabilitySet, RemoteStoreConnector, ServiceHandle, ServiceHandleProvider};
pub use invalidation::{ChangeClass, InvalidationEvent, InvalidationPolicy};
pub use lock::{LockCoordinator, LockGuard, LockStats, LockTicket};
pub use retry::{retry, RetryPolicy, Retryable};

pub use trellis_common::{
    CacheKey, CacheKeyBuilder, CoordConfig, CoordError, CoordResult, ExecutionContext,
    OperationClass,
};
