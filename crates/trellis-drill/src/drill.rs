use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::Instant;

use trellis_common::{CoordError, CoordResult, ExecutionContext, OperationClass};
use trellis_coord::lock::LockStats;
use trellis_coord::{retry, CacheStats, ChangeClass, Coordinator, RetryPolicy};

use crate::sheet::SimulatedSheets;

#[derive(Debug, Clone)]
pub struct DrillPlan {
    pub executions: usize,
    pub concurrency: usize,
    pub tenants: usize,
}

#[derive(Debug, Serialize)]
pub struct DrillReport {
    pub executions: usize,
    pub succeeded: usize,
    /// Failed executions by error kind.
    pub failed: BTreeMap<&'static str, usize>,
    pub elapsed_ms: u64,
    pub cache: CacheStats,
    pub locks: LockStats,
    pub handles_built: u64,
    pub remote_connects: u64,
    pub rows_by_tenant: BTreeMap<String, usize>,
}

fn error_kind(err: &CoordError) -> &'static str {
    match err {
        CoordError::InvalidScope(_) => "invalid_scope",
        CoordError::SerializationViolation { .. } => "serialization_violation",
        CoordError::LockTimeout { .. } => "lock_timeout",
        CoordError::LockReentry { .. } => "lock_reentry",
        CoordError::ServiceHandleIntegrity { .. } => "service_handle_integrity",
        CoordError::Store(_) => "store",
        CoordError::Compute(_) => "compute",
    }
}

fn tenant_name(i: usize, tenants: usize) -> String {
    format!("tenant-{}", i % tenants.max(1))
}

/// One request: read the board summary through the shared cache, append a
/// row under a WRITE lock, then invalidate what the write made stale.
async fn execute(coord: &Coordinator, ctx: &mut ExecutionContext, seq: usize) -> CoordResult<()> {
    let tenant = ctx
        .tenant_id()
        .ok_or_else(|| CoordError::invalid_scope("drill execution without tenant"))?
        .to_string();
    let handle = coord.get_service_handle(ctx, &tenant).await?;

    let reader = Arc::clone(&handle);
    let summary: Value = coord
        .get_cached(Some(&tenant), "summary", "board", 30, move || async move {
            let rows = reader.invoke("read_range", Value::Null).await?;
            Ok(json!({ "rows": rows.as_array().map(Vec::len).unwrap_or(0) }))
        })
        .await?;
    tracing::trace!(tenant_id = %tenant, ?summary, "summary read");

    let resource = coord.resource_key(&tenant, "answers")?;
    let ctx_ref: &ExecutionContext = ctx;
    let handle_ref = &handle;
    let resource_ref = resource.as_str();
    retry(&append_retry_policy(), "append_rows", move || {
        coord.with_lock(ctx_ref, resource_ref, OperationClass::Write, move || async move {
            handle_ref
                .invoke("append_rows", json!({ "rows": [[seq, ctx_ref.request_id()]] }))
                .await
                .map_err(CoordError::Compute)
        })
    })
    .await?;

    coord.invalidate(&tenant, ChangeClass::DataChange).await?;
    Ok(())
}

/// A write that keeps losing the lock is retried once, after a short pause.
fn append_retry_policy() -> RetryPolicy {
    RetryPolicy::fixed(2, Duration::from_millis(200))
}

pub async fn run(coord: Arc<Coordinator>, sheets: Arc<SimulatedSheets>, plan: DrillPlan) -> DrillReport {
    let started = Instant::now();

    let results: Vec<CoordResult<()>> = futures_util::stream::iter(0..plan.executions)
        .map(|i| {
            let coord = Arc::clone(&coord);
            let tenant = tenant_name(i, plan.tenants);
            async move {
                let mut ctx = coord.begin_execution(uuid::Uuid::new_v4().to_string(), Some(&tenant));
                let result = execute(&coord, &mut ctx, i).await;
                if let Err(e) = &result {
                    tracing::warn!(request_id = ctx.request_id(), tenant_id = %tenant, error = %e, "execution failed");
                }
                coord.clear_execution_scope(ctx);
                result
            }
        })
        .buffer_unordered(plan.concurrency.max(1))
        .collect()
        .await;

    let mut failed = BTreeMap::new();
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        *failed.entry(error_kind(err)).or_insert(0) += 1;
    }

    let mut rows_by_tenant = BTreeMap::new();
    for t in 0..plan.tenants.max(1).min(plan.executions.max(1)) {
        let tenant = tenant_name(t, plan.tenants);
        let rows = sheets.row_count(&tenant).await;
        rows_by_tenant.insert(tenant, rows);
    }

    DrillReport {
        executions: plan.executions,
        succeeded: results.iter().filter(|r| r.is_ok()).count(),
        failed,
        elapsed_ms: duration_ms(started.elapsed()),
        cache: coord.cache_stats(),
        locks: coord.lock_stats(),
        handles_built: coord.handles().generation(),
        remote_connects: sheets.connects(),
        rows_by_tenant,
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
