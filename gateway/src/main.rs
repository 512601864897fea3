#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use bulwark_gateway::server;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "bulwark-gateway",
    about = "API gateway with circuit breaking, load balancing and health monitoring"
)]
struct Cli {
    /// Path to gateway config file (.toml or .json)
    #[arg(short, long, default_value = "config.toml", env = "BULWARK_CONFIG")]
    config: PathBuf,

    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8080", env = "BULWARK_LISTEN")]
    listen: String,

    /// Admin API listen address (health, metrics, operator actions)
    #[arg(long, default_value = "0.0.0.0:9091", env = "BULWARK_ADMIN_LISTEN")]
    admin_listen: String,

    /// Tokio worker threads; defaults to the number of CPUs
    #[arg(long, env = "BULWARK_WORKER_THREADS")]
    worker_threads: Option<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(n) = cli.worker_threads {
        builder.worker_threads(n.max(1));
    }
    let rt = builder.enable_all().build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
    }))
}
