pub mod config_cmd;
pub mod control;
pub mod status;
pub mod summary;

use anyhow::Result;
use crate::cli::*;
use crate::client::OverseerClient;
use crate::config::CliConfig;

pub async fn dispatch(cli: Cli) -> Result<()> {
    let config = CliConfig::load()?;
    let client = OverseerClient::new(&config)?;

    match cli.command {
        Commands::Status => status::run(&client, cli.json).await,
        Commands::Summary => summary::run(&client, cli.json).await,
        Commands::Pause { reason } => control::pause(&client, reason.as_deref(), cli.json).await,
        Commands::Resume => control::resume(&client, cli.json).await,
        Commands::Stop => control::stop(&client, cli.json).await,
        Commands::Config(cmd) => config_cmd::run(cmd, &config, cli.json),
    }
}
