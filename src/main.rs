use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use drover::logging::{self, LogConfig};
use drover::rpc::{RpcClient, RpcServer};
use drover::{config, context};
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "drover")]
#[command(about = "Multi-cloud backup, restore and DR test orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    simulation: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator daemon
    Daemon(ServerArgs),
    /// Show daemon status
    Status,
    /// Print the effective configuration
    Config,
    /// Ask the daemon to run a DR cadence sweep now
    Sweep,
}

#[derive(Args, Serialize, Default, Clone)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    workspace_root: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    dr_sweep_interval_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    log_json: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(skip)]
    simulation: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut overrides = match &cli.command {
        Commands::Daemon(args) => args.clone(),
        _ => ServerArgs::default(),
    };
    overrides.simulation = cli.simulation;

    let path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(config::DEFAULT_CONFIG_PATH));
    let config = config::AppConfig::load(&path, Some(&overrides))?;

    match &cli.command {
        Commands::Daemon(_) => {
            logging::init(LogConfig {
                json: config.log_json,
                verbose: config.verbose,
            });
            let ctx = context::AppContext::open(config)
                .await
                .context("Failed to open orchestrator state")?;
            run_daemon(ctx).await.context("Failed to start daemon")?
        }
        Commands::Status => {
            let status: Value = client(&config)?.call_no_params("daemon.status").await?;
            print_json(&status)?
        }
        Commands::Config => print!("{}", config.to_toml()?),
        Commands::Sweep => {
            let report: Value = client(&config)?.call_no_params("drtest.sweep").await?;
            print_json(&report)?
        }
    }

    Ok(())
}

async fn run_daemon(ctx: context::AppContext) -> Result<()> {
    let bind_addr: SocketAddr = ctx
        .config
        .rpc_bind
        .parse()
        .with_context(|| format!("Invalid rpc_bind address {}", ctx.config.rpc_bind))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        simulation = ctx.config.simulation,
        workspace_root = %ctx.config.workspace_root.display(),
        "Starting drover"
    );

    let shutdown = CancellationToken::new();

    let scheduler = ctx.scheduler.clone();
    let interval = Duration::from_secs(ctx.config.dr_sweep_interval_secs.max(1));
    let sweep_shutdown = shutdown.clone();
    let sweeper = tokio::spawn(async move { scheduler.run(interval, sweep_shutdown).await });

    let server = Arc::new(RpcServer::new(ctx.clone(), bind_addr));
    let mut rpc = {
        let server = server.clone();
        tokio::spawn(async move { server.start().await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
        result = &mut rpc => {
            match result {
                Ok(Err(e)) => error!(error = %e, "RPC server stopped"),
                Err(e) => error!(error = %e, "RPC server task failed"),
                Ok(Ok(())) => {}
            }
        }
    }

    server.shutdown();
    shutdown.cancel();
    let _ = sweeper.await;

    info!(active = ctx.orchestrator.active_jobs(), "Waiting for in-flight jobs");
    ctx.orchestrator.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

fn client(config: &config::AppConfig) -> Result<RpcClient> {
    let addr: SocketAddr = config
        .rpc_bind
        .parse()
        .with_context(|| format!("Invalid rpc_bind address {}", config.rpc_bind))?;
    Ok(RpcClient::new(addr))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
