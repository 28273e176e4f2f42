//! Agent daemon: dials the server, then answers aRPC calls against a fixed
//! set of pre-configured per-job snapshot roots (spec §4.6, §4.9 step 1).
//!
//! Job/target selection normally comes from a persisted configuration store
//! (spec §1 Non-goal: out of scope here), so this binary takes job roots
//! directly on the command line — enough to exercise the library end to end.

use std::sync::Arc;

use arpc_fabric::agentfs::{register_job, AgentFs};
use arpc_fabric::config::FabricConfig;
use arpc_fabric::handshake::{ClientIdentity, DEFAULT_UPGRADE_PATH};
use arpc_fabric::router::Router;
use arpc_fabric::session;
use arpc_fabric::{logging, register_reserved_verbs};
use clap::Parser;

/// Runs the agent side of the fabric: dial out to a server, serve file
/// operations for the configured jobs.
#[derive(Parser, Debug)]
#[command(name = "agentd")]
struct Args {
    /// Server address to dial, e.g. `backup-server:8039`.
    #[arg(long)]
    server: String,

    /// Path to a `FabricConfig` TOML document (reconnect policy, worker
    /// count). Optional; defaults apply when omitted.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// This agent's identity, sent as `X-PBS-Agent` during the upgrade.
    #[arg(long)]
    hostname: String,

    /// One job to serve, as `job-id=/path/to/snapshot/root`. Repeatable.
    #[arg(long = "job", value_name = "JOB_ID=PATH")]
    jobs: Vec<String>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    logging::init(&args.log_level);

    let config = match &args.config {
        Some(path) => FabricConfig::load(path).await?,
        None => FabricConfig::default(),
    };

    let router = Arc::new(match config.worker_count {
        Some(workers) => Router::with_worker_count(workers),
        None => Router::new(),
    });
    register_reserved_verbs(&router).await;

    if args.jobs.is_empty() {
        tracing::warn!("no --job roots configured; only echo/ping will answer");
    }
    for job in &args.jobs {
        let (job_id, root) = job
            .split_once('=')
            .ok_or_else(|| format!("--job must be JOB_ID=PATH, got {job:?}"))?;
        let fs = Arc::new(AgentFs::new(root).await?);
        register_job(job_id, fs, &router).await;
        tracing::info!(job_id, root, "serving job");
    }

    let identity = ClientIdentity { hostname: args.hostname, agent_version: env!("CARGO_PKG_VERSION").to_string() };
    let policy = config.reconnect.to_policy();

    tracing::info!(server = %args.server, "dialing server");
    session::dial_and_serve(args.server, DEFAULT_UPGRADE_PATH, identity, policy, router).await;
}
