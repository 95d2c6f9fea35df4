use crate::config::OperationClass;

pub type CoordResult<T> = Result<T, CoordError>;

/// Errors surfaced by the coordination layer. Nothing here is swallowed
/// internally; callers decide what the end user sees.
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    /// Malformed or missing tenant scope in a key. Caller bug.
    #[error("invalid cache scope: {0}")]
    InvalidScope(String),

    /// A value that cannot be represented as plain data was offered to the
    /// distributed cache.
    #[error("value for {key} is not plain data: {reason}")]
    SerializationViolation { key: String, reason: String },

    /// Lock acquisition exceeded the timeout of its operation class.
    #[error("resource busy: {class} lock on {resource_key} not acquired within {waited_ms}ms")]
    LockTimeout {
        resource_key: String,
        class: OperationClass,
        waited_ms: u64,
    },

    /// The holder already holds (or waits for) this resource.
    #[error("{holder_id} attempted to re-acquire {resource_key} without releasing it")]
    LockReentry {
        resource_key: String,
        holder_id: String,
    },

    /// The remote store handle could not be built with all required
    /// capabilities.
    #[error("service handle for tenant {tenant_id} failed verification after {attempts} attempt(s): {reason}")]
    ServiceHandleIntegrity {
        tenant_id: String,
        attempts: u32,
        reason: String,
    },

    /// The shared key/value backend failed.
    #[error("cache backend error: {0}")]
    Store(anyhow::Error),

    /// A caller-supplied factory or critical-section body failed.
    #[error(transparent)]
    Compute(anyhow::Error),
}

/// `?` on an untyped error inside a factory or lock body is a compute
/// failure. Backend call sites wrap with `CoordError::Store` explicitly.
impl From<anyhow::Error> for CoordError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<CoordError>() {
            Ok(coord) => coord,
            Err(err) => CoordError::Compute(err),
        }
    }
}

impl CoordError {
    pub fn invalid_scope(msg: impl Into<String>) -> Self {
        CoordError::InvalidScope(msg.into())
    }

    /// Whether a bounded retry may succeed: a busy resource or a backend blip.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordError::LockTimeout { .. } | CoordError::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_lock_timeout() {
        let err = CoordError::LockTimeout {
            resource_key: "t1:answers".into(),
            class: OperationClass::Write,
            waited_ms: 15_000,
        };
        assert_eq!(
            err.to_string(),
            "resource busy: WRITE lock on t1:answers not acquired within 15000ms"
        );
        assert!(err.is_retryable());
        assert!(!CoordError::invalid_scope("x").is_retryable());
    }

    #[test]
    fn test_untyped_error_converts_to_compute() {
        let err: CoordError = anyhow::anyhow!("remote write failed").into();
        assert!(matches!(err, CoordError::Compute(_)));
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "remote write failed");

        // A typed error that went through anyhow keeps its variant.
        let busy = CoordError::LockTimeout {
            resource_key: "t1:answers".into(),
            class: OperationClass::Write,
            waited_ms: 1,
        };
        let err: CoordError = anyhow::Error::new(busy).into();
        assert!(matches!(err, CoordError::LockTimeout { .. }));
    }
}
