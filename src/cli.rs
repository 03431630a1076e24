use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "moray",
    version,
    about = "Keeps a configured fleet of Kubernetes port-forward tunnels alive."
)]
pub struct CliArgs {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log file path (default: moray.log, so logging never fights the TUI)
    #[arg(long)]
    pub log: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run all configured database backups without the TUI and exit
    Backup {
        /// Directory to store backups in
        #[arg(long, default_value = "backups")]
        dir: PathBuf,

        /// Seconds to wait for each port-forward to become active
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },
}
