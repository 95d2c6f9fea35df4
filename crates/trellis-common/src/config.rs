use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lock operation class. Determines how long an acquirer may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationClass {
    Read,
    Write,
    Critical,
}

impl OperationClass {
    pub const ALL: [OperationClass; 3] = [
        OperationClass::Read,
        OperationClass::Write,
        OperationClass::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationClass::Read => "READ",
            OperationClass::Write => "WRITE",
            OperationClass::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(OperationClass::Read),
            "write" => Ok(OperationClass::Write),
            "critical" => Ok(OperationClass::Critical),
            other => Err(format!("unknown operation class: {other}")),
        }
    }
}

/// The single timeout table consulted by every lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeouts {
    pub read: Duration,
    pub write: Duration,
    pub critical: Duration,
}

impl LockTimeouts {
    pub fn timeout_for(&self, class: OperationClass) -> Duration {
        match class {
            OperationClass::Read => self.read,
            OperationClass::Write => self.write,
            OperationClass::Critical => self.critical,
        }
    }

    pub fn longest(&self) -> Duration {
        self.read.max(self.write).max(self.critical)
    }
}

impl Default for LockTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(5),
            write: Duration::from_secs(15),
            critical: Duration::from_secs(30),
        }
    }
}

/// Tunables for the coordination layer.
///
/// All values are defaults that can be overridden through `TRELLIS_*`
/// environment variables (see [`CoordConfig::from_env`]).
#[derive(Debug, Clone)]
pub struct CoordConfig {
    pub lock_timeouts: LockTimeouts,
    /// How long a granted ticket stays live without being released.
    pub lock_lease: Duration,
    /// Maximum age of a cached service handle before it is rebuilt.
    pub handle_ttl: Duration,
    /// Total handle construction attempts before giving up.
    pub handle_max_attempts: u32,
    /// Fixed pause between handle construction attempts.
    pub handle_retry_delay: Duration,
    /// How long a concurrent `get_or_compute` caller waits for the in-flight fill.
    pub stampede_wait: Duration,
    /// Namespaces whose keys are not tenant-scoped.
    pub global_namespaces: Vec<String>,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            lock_timeouts: LockTimeouts::default(),
            lock_lease: Duration::from_secs(120),
            handle_ttl: Duration::from_secs(300),
            handle_max_attempts: 2,
            handle_retry_delay: Duration::from_millis(200),
            stampede_wait: Duration::from_secs(10),
            global_namespaces: vec!["system".to_string()],
        }
    }
}

impl CoordConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from an arbitrary variable lookup. Unparseable values
    /// are ignored with a warning and the default is kept.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let ms = |name: &str| -> Option<Duration> {
            let raw = lookup(name)?;
            match raw.trim().parse::<u64>() {
                Ok(v) => Some(Duration::from_millis(v)),
                Err(_) => {
                    tracing::warn!(var = name, value = %raw, "ignoring unparseable duration");
                    None
                }
            }
        };

        let mut cfg = Self::default();
        if let Some(d) = ms("TRELLIS_LOCK_READ_TIMEOUT_MS") {
            cfg.lock_timeouts.read = d;
        }
        if let Some(d) = ms("TRELLIS_LOCK_WRITE_TIMEOUT_MS") {
            cfg.lock_timeouts.write = d;
        }
        if let Some(d) = ms("TRELLIS_LOCK_CRITICAL_TIMEOUT_MS") {
            cfg.lock_timeouts.critical = d;
        }
        if let Some(d) = ms("TRELLIS_LOCK_LEASE_MS") {
            cfg.lock_lease = d;
        }
        if let Some(d) = ms("TRELLIS_HANDLE_TTL_MS") {
            cfg.handle_ttl = d;
        }
        if let Some(d) = ms("TRELLIS_HANDLE_RETRY_DELAY_MS") {
            cfg.handle_retry_delay = d;
        }
        if let Some(d) = ms("TRELLIS_STAMPEDE_WAIT_MS") {
            cfg.stampede_wait = d;
        }
        if let Some(n) = lookup("TRELLIS_HANDLE_MAX_ATTEMPTS").and_then(|v| v.trim().parse::<u32>().ok()) {
            cfg.handle_max_attempts = n.max(1);
        }
        if let Some(raw) = lookup("TRELLIS_GLOBAL_NAMESPACES") {
            cfg.global_namespaces = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if cfg.lock_lease <= cfg.lock_timeouts.longest() {
            tracing::warn!(
                lease_ms = cfg.lock_lease.as_millis() as u64,
                "lock lease is not longer than the longest class timeout; waiters may observe lease expiry"
            );
        }
        cfg
    }

    pub fn with_lock_timeout(mut self, class: OperationClass, timeout: Duration) -> Self {
        match class {
            OperationClass::Read => self.lock_timeouts.read = timeout,
            OperationClass::Write => self.lock_timeouts.write = timeout,
            OperationClass::Critical => self.lock_timeouts.critical = timeout,
        }
        self
    }

    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    pub fn with_handle_ttl(mut self, ttl: Duration) -> Self {
        self.handle_ttl = ttl;
        self
    }

    pub fn with_handle_retries(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.handle_max_attempts = max_attempts.max(1);
        self.handle_retry_delay = delay;
        self
    }

    pub fn with_stampede_wait(mut self, wait: Duration) -> Self {
        self.stampede_wait = wait;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_default_timeout_table() {
        let t = LockTimeouts::default();
        assert_eq!(t.timeout_for(OperationClass::Read), Duration::from_secs(5));
        assert_eq!(t.timeout_for(OperationClass::Write), Duration::from_secs(15));
        assert_eq!(t.timeout_for(OperationClass::Critical), Duration::from_secs(30));
        assert!(CoordConfig::default().lock_lease > t.longest());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars = HashMap::from([
            ("TRELLIS_LOCK_WRITE_TIMEOUT_MS", "2500"),
            ("TRELLIS_HANDLE_MAX_ATTEMPTS", "0"),
            ("TRELLIS_STAMPEDE_WAIT_MS", "not-a-number"),
            ("TRELLIS_GLOBAL_NAMESPACES", "system, templates,"),
        ]);
        let cfg = CoordConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.lock_timeouts.write, Duration::from_millis(2500));
        assert_eq!(cfg.lock_timeouts.read, Duration::from_secs(5));
        assert_eq!(cfg.handle_max_attempts, 1);
        assert_eq!(cfg.stampede_wait, CoordConfig::default().stampede_wait);
        assert_eq!(cfg.global_namespaces, vec!["system", "templates"]);
    }

    #[test]
    fn test_operation_class_parse() {
        assert_eq!("write".parse::<OperationClass>(), Ok(OperationClass::Write));
        assert_eq!("CRITICAL".parse::<OperationClass>(), Ok(OperationClass::Critical));
        assert!("exclusive".parse::<OperationClass>().is_err());
        assert_eq!(OperationClass::Read.to_string(), "READ");
    }
}
