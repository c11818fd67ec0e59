use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "baton", version, about, long_about = None)]
pub struct Cli {
    /// Log filter used when RUST_LOG is unset (e.g. `info`, `election=debug`)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Contends for the lease and runs the selected workload while leading
    Run(RunArgs),
    /// Runs several candidates in-process against one in-memory lease store
    Simulate(SimulateArgs),
    /// Lists the workloads a leader can run
    Workloads,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Identity written into the lease; defaults to the pod/host name
    #[arg(long, env = "HOSTNAME")]
    pub identity: Option<String>,

    /// Lease name; the record is stored as `<name>-lock`
    #[arg(long = "lease-name", env = "BATON_LEASE_NAME")]
    pub lease_name: Option<String>,

    /// Scope (namespace) holding the lease record
    #[arg(long, env = "BATON_LEASE_SCOPE")]
    pub scope: Option<String>,

    /// JSON settings file; command-line values take precedence
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[arg(long, value_name = "SECS")]
    pub lease_duration: Option<u64>,

    #[arg(long, value_name = "SECS")]
    pub renew_deadline: Option<u64>,

    #[arg(long, value_name = "SECS")]
    pub retry_period: Option<u64>,

    /// Leave the lease to expire instead of clearing it on shutdown
    #[arg(long)]
    pub no_release_on_cancel: bool,

    /// Protected work to run while leading (see `baton workloads`)
    #[arg(long)]
    pub workload: Option<String>,

    /// Seconds to wait before contending
    #[arg(long, env = "BATON_START_DELAY", value_name = "SECS")]
    pub start_delay: Option<u64>,
}

#[derive(Debug, Clone, Args)]
pub struct SimulateArgs {
    /// Number of in-process candidates
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u16).range(1..=32))]
    pub candidates: u16,

    /// Cancel the current leader after this many seconds to show failover
    #[arg(long, value_name = "SECS")]
    pub fail_leader_after: Option<u64>,

    /// Total seconds to run before stopping everyone
    #[arg(long, default_value_t = 10, value_name = "SECS")]
    pub duration: u64,

    #[arg(long, default_value_t = 4, value_name = "SECS")]
    pub lease_duration: u64,

    #[arg(long, default_value_t = 2, value_name = "SECS")]
    pub renew_deadline: u64,

    #[arg(long, default_value_t = 1, value_name = "SECS")]
    pub retry_period: u64,
}
