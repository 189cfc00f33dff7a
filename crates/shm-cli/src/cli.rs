use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "shmstore",
    about = "Shared-memory object store",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the effective store configuration
    Config(ConfigArgs),
    /// Run a synthetic create/seal/release workload and print stats
    Stress(StressArgs),
    /// Drive a mutable object through write/read rounds
    Channel(ChannelArgs),
}

#[derive(Args)]
pub struct ConfigArgs {
    /// TOML configuration file
    #[arg(long)]
    pub file: Option<PathBuf>,
}

#[derive(Args)]
pub struct StressArgs {
    /// TOML configuration file
    #[arg(long)]
    pub file: Option<PathBuf>,
    /// Number of objects to create
    #[arg(long, default_value_t = 1000)]
    pub objects: usize,
    /// Data bytes per object
    #[arg(long, default_value_t = 64 * 1024)]
    pub size: usize,
    /// Most recent objects kept referenced; older ones are released
    #[arg(long, default_value_t = 0)]
    pub hold: usize,
    /// Override the primary capacity in bytes
    #[arg(long)]
    pub capacity: Option<u64>,
    /// Enable fallback allocations in this directory
    #[arg(long)]
    pub fallback_dir: Option<PathBuf>,
    /// Fallback ceiling in bytes (with --fallback-dir)
    #[arg(long, default_value_t = 1024 * 1024 * 1024)]
    pub fallback_capacity: u64,
}

#[derive(Args)]
pub struct ChannelArgs {
    /// TOML configuration file
    #[arg(long)]
    pub file: Option<PathBuf>,
    /// Number of versions to publish
    #[arg(long, default_value_t = 100)]
    pub rounds: u64,
    /// Number of reader threads
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..))]
    pub readers: u32,
    /// Payload capacity in bytes
    #[arg(long, default_value_t = 4096)]
    pub capacity: usize,
}
