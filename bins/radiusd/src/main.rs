use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use radius::types::{CodeSet, NullVerifier, PacketCode};
use radius::unlang::Dictionary;
use radius::{HeaderOnlyCodec, MapRegistry, Server, WorkerContext};

use crate::config::Config;
use crate::constants::DEFAULT_WORKERS;

mod config;
mod constants;

#[derive(Parser)]
struct Cli {
    /// Sets a custom config file
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = constants::DEFAULT_CONFIG_FILE_PATH
    )]
    config: PathBuf,

    /// Check the configuration and exit
    #[arg(long)]
    check: bool,

    /// Enables verbose output on STDOUT
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = Config::read(Some(cli.config)).context("reading configuration")?;
    cfg.listen.validate().context("validating listener")?;

    let dict = Arc::new(Dictionary::core());
    let maps = MapRegistry::new();
    let modules = cfg.build_modules().context("instantiating modules")?;

    let server_policy = cfg
        .server
        .compile(&modules, &maps, &dict)
        .context("compiling server sections")?;
    let dynamic_policy = match &cfg.dynamic_server {
        Some(section) => Some(
            section
                .compile(&modules, &maps, &dict)
                .context("compiling dynamic-client sections")?,
        ),
        None => None,
    };

    if cli.check {
        info!("Configuration appears to be OK");
        return Ok(());
    }

    let worker_ctx = Arc::new(WorkerContext {
        server: server_policy,
        dynamic_server: dynamic_policy,
        codec: Arc::new(HeaderOnlyCodec),
        dict,
        max_request_time: cfg.max_request_time(),
    });

    let allowed = CodeSet::new([
        PacketCode::AccessRequest,
        PacketCode::AccountingRequest,
        PacketCode::CoaRequest,
        PacketCode::DisconnectRequest,
        PacketCode::StatusServer,
    ]);

    let statics = cfg.client.iter().map(|c| c.to_static()).collect();
    let workers = cfg.workers.unwrap_or(DEFAULT_WORKERS);

    run(cfg, statics, allowed, worker_ctx, workers)
}

#[tokio::main]
async fn run(
    cfg: Config,
    statics: Vec<radius::StaticClient>,
    allowed: CodeSet,
    worker_ctx: Arc<WorkerContext>,
    workers: usize,
) -> Result<()> {
    let server = Server::bind(
        &cfg.listen,
        statics,
        allowed,
        Arc::new(NullVerifier),
        worker_ctx,
        workers,
    )
    .context("binding listener")?;

    info!(addr = %server.local_addr(), "radiusd started");
    server.run().await.context("listener failed")?;
    Ok(())
}
