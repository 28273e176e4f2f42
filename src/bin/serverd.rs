//! Server daemon: accepts agent connections, tracks them in the connection
//! broker, and answers the out-of-band HTTP mount control surface that
//! starts and tears down per-job NFS exports (spec §4.9, §4.10, §6).

use std::sync::Arc;

use arpc_fabric::broker::Broker;
use arpc_fabric::config::FabricConfig;
use arpc_fabric::logging;
use arpc_fabric::mount::{MountBridge, MountControl};
use arpc_fabric::register_reserved_verbs;
use arpc_fabric::router::Router;
use arpc_fabric::session;
use clap::Parser;
use tokio::net::TcpListener;

/// Runs the server side of the fabric: accept agent sessions, serve the
/// mount control HTTP surface.
#[derive(Parser, Debug)]
#[command(name = "serverd")]
struct Args {
    /// Path to a `FabricConfig` TOML document.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Overrides the config's `listen_addr` (where agents dial in).
    #[arg(long)]
    listen: Option<String>,

    /// Address for the `/plus/mount/...` control surface.
    #[arg(long, default_value = "127.0.0.1:8040")]
    control_listen: String,

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
    let listen_addr = args.listen.unwrap_or(config.listen_addr);

    let agent_router = Arc::new(match config.worker_count {
        Some(workers) => Router::with_worker_count(workers),
        None => Router::new(),
    });
    register_reserved_verbs(&agent_router).await;

    let broker = Arc::new(Broker::new());
    let agent_listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(%listen_addr, "accepting agents");
    let agents_task = tokio::spawn(session::serve_agents(agent_listener, agent_router, broker.clone()));

    let bridge = MountBridge::new(config.mount_base_dir);
    let control = Arc::new(MountControl::new(bridge, broker));
    let control_listener = TcpListener::bind(&args.control_listen).await?;
    tracing::info!(control_listen = %args.control_listen, "accepting mount control requests");
    let control_task = tokio::spawn(control.serve(control_listener));

    tokio::select! {
        result = agents_task => { result??; }
        result = control_task => { result??; }
    }
    Ok(())
}
