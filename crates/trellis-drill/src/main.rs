mod args;
mod drill;
mod sheet;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use trellis_common::telemetry::{init_tracing, LogFormat};
use trellis_common::CoordConfig;
use trellis_coord::Coordinator;
use trellis_meta::{EtcdMetaStore, MemoryMetaStore, MetaStore};

use crate::args::Args;
use crate::drill::DrillPlan;
use crate::sheet::SimulatedSheets;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_format = args.log_format.parse::<LogFormat>().unwrap_or_else(|e| {
        eprintln!("{e}, using text");
        LogFormat::Text
    });
    let telemetry = init_tracing(
        "trellis-drill",
        args.otlp_url.as_deref(),
        args.otlp_token.as_deref(),
        log_format,
    );

    let store: Arc<dyn MetaStore> = match &args.etcd_endpoint {
        Some(endpoint) => Arc::new(EtcdMetaStore::connect(std::slice::from_ref(endpoint)).await?),
        None => Arc::new(MemoryMetaStore::new()),
    };

    let config = CoordConfig::from_env();
    tracing::info!(
        executions = args.executions,
        concurrency = args.concurrency,
        tenants = args.tenants,
        shared_store = args.etcd_endpoint.is_some(),
        ?config,
        "trellis-drill starting"
    );

    let sheets = Arc::new(SimulatedSheets::new(
        Duration::from_millis(args.remote_latency_ms),
        args.strip_every,
    ));
    let coord = Arc::new(Coordinator::new(config, store, sheets.clone()));

    let report = drill::run(
        coord,
        sheets,
        DrillPlan {
            executions: args.executions,
            concurrency: args.concurrency,
            tenants: args.tenants,
        },
    )
    .await;

    println!("{}", serde_json::to_string_pretty(&report)?);

    telemetry.shutdown();
    Ok(())
}
