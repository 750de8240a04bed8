use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "overseerctl",
    about = "Overseer - control a running tuning loop",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Output raw JSON (for scripting/piping)
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show loop health
    Status,

    /// Show the latest generation summary
    Summary,

    /// Pause generation advancement at the next boundary
    Pause {
        /// Recorded as the safe-pause reason
        #[arg(long)]
        reason: Option<String>,
    },

    /// Clear safe-pause (manual or breaker) at the next boundary
    Resume,

    /// Finish the current generation, persist and exit
    Stop,

    /// Manage CLI configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Key name (url, timeout_secs)
        key: String,
        /// Value to set
        value: String,
    },
}
