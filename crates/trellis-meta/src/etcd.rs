use anyhow::{Context, Result};
use etcd_client::{Client, DeleteOptions, PutOptions};

use crate::types::MetaStore;

/// Root under which every key of this store lives, so one etcd cluster can
/// be shared with other workloads.
pub const DEFAULT_ROOT: &str = "/trellis/cache/";

/// `MetaStore` backed by etcd. TTLs become etcd leases, so expiry is enforced
/// server-side and observed by every process sharing the cluster.
#[derive(Clone)]
pub struct EtcdMetaStore {
    client: Client,
    root: String,
}

impl EtcdMetaStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        Self::connect_with_root(endpoints, DEFAULT_ROOT).await
    }

    pub async fn connect_with_root(endpoints: &[String], root: &str) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .with_context(|| format!("connecting to etcd at {endpoints:?}"))?;
        tracing::info!(?endpoints, root, "etcd cache backend connected");
        Ok(Self {
            client,
            root: root.to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.root)
    }
}

/// etcd leases are whole seconds; round up and never grant zero.
fn lease_seconds(ttl_ms: u64) -> i64 {
    i64::try_from(ttl_ms.div_ceil(1000).max(1)).unwrap_or(i64::MAX)
}

#[async_trait::async_trait]
impl MetaStore for EtcdMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<u64> {
        let mut client = self.client.clone();
        let opts = match ttl_ms {
            Some(ttl_ms) => {
                let lease = client.lease_grant(lease_seconds(ttl_ms), None).await?;
                Some(PutOptions::new().with_lease(lease.id()))
            }
            None => None,
        };
        let resp = client.put(self.full_key(key), value, opts).await?;
        Ok(resp.header().map(|h| h.revision() as u64).unwrap_or(0))
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let resp = self.client.clone().get(self.full_key(key), None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| (kv.value().to_vec(), kv.mod_revision() as u64)))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let resp = self.client.clone().delete(self.full_key(key), None).await?;
        Ok(resp.deleted() > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let resp = self
            .client
            .clone()
            .delete(self.full_key(prefix), Some(DeleteOptions::new().with_prefix()))
            .await?;
        tracing::debug!(prefix, deleted = resp.deleted(), "etcd prefix delete");
        Ok(u64::try_from(resp.deleted()).unwrap_or(0))
    }
}
