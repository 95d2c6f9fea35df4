use clap::Parser;

/// Runs simulated request executions concurrently against the coordination
/// layer and prints a JSON report.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Number of request executions to run.
    #[arg(long, env = "TRELLIS_DRILL_EXECUTIONS", default_value_t = 200)]
    pub executions: usize,

    /// Executions allowed in flight at once.
    #[arg(long, env = "TRELLIS_DRILL_CONCURRENCY", default_value_t = 32)]
    pub concurrency: usize,

    /// Distinct tenants; executions are spread across them round-robin.
    #[arg(long, env = "TRELLIS_DRILL_TENANTS", default_value_t = 4)]
    pub tenants: usize,

    /// Simulated latency of each remote store call.
    #[arg(long, default_value_t = 20)]
    pub remote_latency_ms: u64,

    /// Every Nth connection to the remote store comes back without
    /// `write_range`. 0 disables fault injection.
    #[arg(long, default_value_t = 0)]
    pub strip_every: u64,

    /// Shared cache backend. Without it an in-process memory store is used.
    #[arg(long, env = "ETCD_ENDPOINT")]
    pub etcd_endpoint: Option<String>,

    #[arg(long, env = "TRELLIS_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// OTLP endpoint for exporting traces.
    #[arg(long, env = "TRELLIS_OTLP_URL")]
    pub otlp_url: Option<String>,

    #[arg(long, env = "TRELLIS_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}
