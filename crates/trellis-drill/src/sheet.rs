use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use trellis_coord::{Capability, CapabilitySet, RemoteStoreConnector};

type Rows = Vec<Vec<Value>>;

#[derive(Default)]
struct Sheets {
    by_tenant: HashMap<String, Rows>,
}

/// Connector whose capabilities read and write a per-tenant row list.
pub struct SimulatedSheets {
    sheets: Arc<Mutex<Sheets>>,
    latency: Duration,
    strip_every: u64,
    connects: AtomicU64,
}

impl SimulatedSheets {
    pub fn new(latency: Duration, strip_every: u64) -> Self {
        Self {
            sheets: Arc::new(Mutex::new(Sheets::default())),
            latency,
            strip_every,
            connects: AtomicU64::new(0),
        }
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub async fn row_count(&self, tenant_id: &str) -> usize {
        self.sheets
            .lock()
            .await
            .by_tenant
            .get(tenant_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn capability<F>(&self, tenant_id: &str, op: F) -> Capability
    where
        F: Fn(&mut Rows, Value) -> anyhow::Result<Value> + Send + Sync + Copy + 'static,
    {
        let sheets = Arc::clone(&self.sheets);
        let tenant = tenant_id.to_string();
        let latency = self.latency;
        Capability::new(move |args| {
            let sheets = Arc::clone(&sheets);
            let tenant = tenant.clone();
            async move {
                tokio::time::sleep(latency).await;
                let mut guard = sheets.lock().await;
                let rows = guard.by_tenant.entry(tenant).or_default();
                op(rows, args)
            }
        })
    }
}

fn parse_rows(args: &Value) -> anyhow::Result<Rows> {
    let rows = args
        .get("rows")
        .ok_or_else(|| anyhow::anyhow!("missing `rows` argument"))?;
    Ok(serde_json::from_value(rows.clone())?)
}

#[async_trait]
impl RemoteStoreConnector for SimulatedSheets {
    async fn connect(&self, tenant_id: &str) -> anyhow::Result<CapabilitySet> {
        let n = self.connects.fetch_add(1, Ordering::Relaxed) + 1;
        tokio::time::sleep(self.latency).await;

        let set = CapabilitySet::new()
            .with(
                "open_sheet",
                self.capability(tenant_id, |rows, _| Ok(json!({ "rows": rows.len() }))),
            )
            .with(
                "read_range",
                self.capability(tenant_id, |rows, _| Ok(json!(rows))),
            )
            .with(
                "write_range",
                self.capability(tenant_id, |rows, args| {
                    *rows = parse_rows(&args)?;
                    Ok(json!({ "written": rows.len() }))
                }),
            )
            .with(
                "append_rows",
                self.capability(tenant_id, |rows, args| {
                    let mut new_rows = parse_rows(&args)?;
                    let appended = new_rows.len();
                    rows.append(&mut new_rows);
                    Ok(json!({ "appended": appended, "total": rows.len() }))
                }),
            )
            .with(
                "clear_range",
                self.capability(tenant_id, |rows, _| {
                    let cleared = rows.len();
                    rows.clear();
                    Ok(json!({ "cleared": cleared }))
                }),
            );

        if self.strip_every > 0 && n % self.strip_every == 0 {
            tracing::debug!(tenant_id, connect = n, "injecting stripped capability");
            return Ok(set.with_stripped("write_range"));
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_capabilities_share_tenant_rows() {
        let sheets = SimulatedSheets::new(Duration::from_millis(5), 0);
        let set = sheets.connect("t1").await.unwrap();
        let append = set.get("append_rows").unwrap();
        let out = append.call(json!({ "rows": [[1, "a"], [2, "b"]] })).await.unwrap();
        assert_eq!(out["total"], 2);

        let read = set.get("read_range").unwrap();
        assert_eq!(read.call(Value::Null).await.unwrap(), json!([[1, "a"], [2, "b"]]));
        assert_eq!(sheets.row_count("t1").await, 2);
        assert_eq!(sheets.row_count("t2").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strip_every_removes_write_range() {
        let sheets = SimulatedSheets::new(Duration::ZERO, 2);
        assert!(sheets.connect("t1").await.unwrap().get("write_range").is_some());
        assert!(sheets.connect("t1").await.unwrap().get("write_range").is_none());
        assert_eq!(sheets.connects(), 2);
    }

    #[tokio::test]
    async fn test_bad_arguments_are_errors() {
        let sheets = SimulatedSheets::new(Duration::ZERO, 0);
        let set = sheets.connect("t1").await.unwrap();
        let err = set.get("append_rows").unwrap().call(json!({})).await.unwrap_err();
        assert!(err.to_string().contains("rows"));
    }
}
