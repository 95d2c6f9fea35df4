use std::collections::HashSet;
use std::fmt;

use crate::error::{CoordError, CoordResult};

/// Reserved separator between key segments.
pub const KEY_SEPARATOR: char = ':';

/// Tenant segment used by global (non tenant-scoped) namespaces. It is not a
/// legal tenant id.
const GLOBAL_TENANT: &str = "*";

/// A validated `{tenant}:{namespace}:{identifier}` key. Only
/// [`CacheKeyBuilder`] can construct one; segments are non-empty and free of
/// the separator, so distinct triples never render the same.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    encoded: String,
    tenant_len: usize,
    namespace_len: usize,
}

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// `None` for keys in a global namespace.
    pub fn tenant(&self) -> Option<&str> {
        let t = &self.encoded[..self.tenant_len];
        (t != GLOBAL_TENANT).then_some(t)
    }

    pub fn namespace(&self) -> &str {
        let start = self.tenant_len + 1;
        &self.encoded[start..start + self.namespace_len]
    }

    pub fn identifier(&self) -> &str {
        &self.encoded[self.tenant_len + self.namespace_len + 2..]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.encoded
    }
}

/// Builds deterministic cache keys, lock resource keys and invalidation
/// prefixes.
#[derive(Debug, Clone, Default)]
pub struct CacheKeyBuilder {
    global_namespaces: HashSet<String>,
}

impl CacheKeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global_namespaces<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            global_namespaces: namespaces.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_global(&self, namespace: &str) -> bool {
        self.global_namespaces.contains(namespace)
    }

    pub fn build_key(
        &self,
        tenant_id: Option<&str>,
        namespace: &str,
        identifier: &str,
    ) -> CoordResult<CacheKey> {
        validate_segment("namespace", namespace)?;
        validate_segment("identifier", identifier)?;
        let tenant = self.tenant_segment(tenant_id, namespace)?;

        Ok(CacheKey {
            encoded: format!("{tenant}{KEY_SEPARATOR}{namespace}{KEY_SEPARATOR}{identifier}"),
            tenant_len: tenant.len(),
            namespace_len: namespace.len(),
        })
    }

    /// Prefix shared by every key of `namespace` for the given tenant,
    /// separator included so `profile` never matches `profiles`.
    pub fn namespace_prefix(&self, tenant_id: Option<&str>, namespace: &str) -> CoordResult<String> {
        validate_segment("namespace", namespace)?;
        let tenant = self.tenant_segment(tenant_id, namespace)?;
        Ok(format!("{tenant}{KEY_SEPARATOR}{namespace}{KEY_SEPARATOR}"))
    }

    /// Lock resource key for a tenant-owned entity, e.g. `t1:answers`.
    pub fn resource_key(&self, tenant_id: &str, entity: &str) -> CoordResult<String> {
        validate_tenant(tenant_id)?;
        validate_segment("entity", entity)?;
        Ok(format!("{tenant_id}{KEY_SEPARATOR}{entity}"))
    }

    fn tenant_segment<'a>(&self, tenant_id: Option<&'a str>, namespace: &str) -> CoordResult<&'a str> {
        match (self.is_global(namespace), tenant_id) {
            (true, None) => Ok(GLOBAL_TENANT),
            (true, Some(t)) => Err(CoordError::invalid_scope(format!(
                "namespace {namespace} is global but tenant {t} was supplied"
            ))),
            (false, None) => Err(CoordError::invalid_scope(format!(
                "namespace {namespace} is tenant-scoped but no tenant id was supplied"
            ))),
            (false, Some(t)) => {
                validate_tenant(t)?;
                Ok(t)
            }
        }
    }
}

pub fn validate_tenant(tenant_id: &str) -> CoordResult<()> {
    validate_segment("tenant id", tenant_id)?;
    if tenant_id == GLOBAL_TENANT {
        return Err(CoordError::invalid_scope("tenant id `*` is reserved"));
    }
    Ok(())
}

fn validate_segment(kind: &str, value: &str) -> CoordResult<()> {
    if value.is_empty() {
        return Err(CoordError::invalid_scope(format!("{kind} must not be empty")));
    }
    if value.contains(KEY_SEPARATOR) {
        return Err(CoordError::invalid_scope(format!(
            "{kind} {value:?} contains reserved separator {KEY_SEPARATOR:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> CacheKeyBuilder {
        CacheKeyBuilder::with_global_namespaces(["system"])
    }

    #[test]
    fn test_key_format_and_accessors() {
        let key = builder().build_key(Some("t1"), "profile", "user-7").unwrap();
        assert_eq!(key.as_str(), "t1:profile:user-7");
        assert_eq!(key.tenant(), Some("t1"));
        assert_eq!(key.namespace(), "profile");
        assert_eq!(key.identifier(), "user-7");
    }

    #[test]
    fn test_global_namespace() {
        let b = builder();
        let key = b.build_key(None, "system", "flags").unwrap();
        assert_eq!(key.as_str(), "*:system:flags");
        assert_eq!(key.tenant(), None);
        assert!(matches!(
            b.build_key(Some("t1"), "system", "flags"),
            Err(CoordError::InvalidScope(_))
        ));
    }

    #[test]
    fn test_missing_tenant_rejected() {
        let err = builder().build_key(None, "answers", "row-1").unwrap_err();
        assert!(matches!(err, CoordError::InvalidScope(_)));
    }

    #[test]
    fn test_separator_and_empty_rejected() {
        let b = builder();
        assert!(b.build_key(Some("t:1"), "answers", "x").is_err());
        assert!(b.build_key(Some("t1"), "ans:wers", "x").is_err());
        assert!(b.build_key(Some("t1"), "answers", "a:b").is_err());
        assert!(b.build_key(Some(""), "answers", "x").is_err());
        assert!(b.build_key(Some("t1"), "answers", "").is_err());
        assert!(b.build_key(Some("*"), "answers", "x").is_err());
    }

    #[test]
    fn test_prefix_and_resource_key() {
        let b = builder();
        assert_eq!(b.namespace_prefix(Some("t1"), "profile").unwrap(), "t1:profile:");
        assert_eq!(b.resource_key("t1", "answers").unwrap(), "t1:answers");
        assert!(b.resource_key("", "answers").is_err());

        let key = b.build_key(Some("t1"), "profile", "x").unwrap();
        assert!(key.as_str().starts_with(&b.namespace_prefix(Some("t1"), "profile").unwrap()));
        assert!(!key
            .as_str()
            .starts_with(&b.namespace_prefix(Some("t1"), "prof").unwrap()));
    }
}
