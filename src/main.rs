use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use election::{
    InMemoryLeaseStore, LeaderCallbacks, LeaderElector, LeaseStore, ShutdownCoordinator, WorkloadRegistry,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod cli;
mod settings;
mod simulate;

use cli::{Cli, Commands, RunArgs};
use settings::AgentSettings;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    info!(version = env!("CARGO_PKG_VERSION"), "baton starting");

    match execute(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "baton exited with an error");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn execute(command: Commands) -> Result<()> {
    match command {
        Commands::Run(args) => {
            warn!(
                "no LeaseStore adapter is linked into this build; `baton run` keeps the lease in this \
                 process and is a single-process demo: separate replicas will not coordinate"
            );
            run(&args, Arc::new(InMemoryLeaseStore::new())).await
        }
        Commands::Simulate(args) => {
            let shutdown = ShutdownCoordinator::new();
            let _signals = shutdown.listen().context("installing signal handlers")?;
            let report = simulate::simulate(&args, shutdown.token()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Workloads => {
            for name in WorkloadRegistry::builtin().names() {
                println!("{name}");
            }
            Ok(())
        }
    }
}

/// Runs the agent against `store` until SIGINT/SIGTERM.
async fn run(args: &RunArgs, store: Arc<dyn LeaseStore>) -> Result<()> {
    let settings = AgentSettings::from_args(args)?;
    let shutdown = ShutdownCoordinator::new();
    let signals = shutdown.listen().context("installing signal handlers")?;

    lead(&settings, store, shutdown.token()).await?;

    signals.abort();
    info!("shutdown complete");
    Ok(())
}

/// Contends for the configured lease through `store` until `cancel` fires.
async fn lead(settings: &AgentSettings, store: Arc<dyn LeaseStore>, cancel: CancellationToken) -> Result<()> {
    let work = WorkloadRegistry::builtin().resolve(&settings.workload)?;
    let elector = LeaderElector::new(settings.election.clone(), store, LeaderCallbacks::with_work(work))?;

    if !settings.start_delay.is_zero() {
        info!(delay = ?settings.start_delay, "delaying start");
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("shutdown requested before start");
                return Ok(());
            }
            _ = sleep(settings.start_delay) => {}
        }
    }

    info!(
        lease = %settings.election.lease,
        identity = %settings.election.identity,
        workload = %settings.workload,
        "starting leader election"
    );
    elector.run(cancel).await;
    Ok(())
}
