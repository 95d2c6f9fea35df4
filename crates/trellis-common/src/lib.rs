pub mod config;
pub mod error;
pub mod execution_context;
pub mod keys;
pub mod telemetry;

pub use config::{CoordConfig, OperationClass};
pub use error::{CoordError, CoordResult};
pub use execution_context::{ExecutionCache, ExecutionContext, ExecutionSummary};
pub use keys::{CacheKey, CacheKeyBuilder, KEY_SEPARATOR};
