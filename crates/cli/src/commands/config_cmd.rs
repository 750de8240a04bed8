use anyhow::Result;
use colored::Colorize;

use crate::cli::ConfigCommand;
use crate::config::CliConfig;

pub fn run(cmd: ConfigCommand, config: &CliConfig, json_mode: bool) -> Result<()> {
    match cmd {
        ConfigCommand::Show => show(config, json_mode),
        ConfigCommand::Set { key, value } => set(&key, &value),
    }
}

/// Env vars that take precedence over the config file.
fn active_overrides() -> Vec<&'static str> {
    ["OVERSEER_URL", "OVERSEER_CLI_TIMEOUT_SECS"]
        .into_iter()
        .filter(|var| std::env::var(var).is_ok())
        .collect()
}

fn show(config: &CliConfig, json_mode: bool) -> Result<()> {
    let path = CliConfig::path()?;
    let overrides = active_overrides();

    if json_mode {
        let data = serde_json::json!({
            "file": path,
            "url": config.url,
            "timeout_secs": config.timeout_secs,
            "env_overrides": overrides,
        });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    println!();
    println!("  {}", "CLI configuration".bold());
    println!("  {}", "─".repeat(36).dimmed());
    println!("  {}      {}", "file:".dimmed(), path.display());
    println!("  {}       {}", "url:".dimmed(), config.url);
    println!("  {} {}s", "timeout:".dimmed(), config.timeout_secs);
    println!();
    for var in overrides {
        println!("  {} {var} overrides the file", "ℹ".blue());
    }

    Ok(())
}

fn set(key: &str, value: &str) -> Result<()> {
    CliConfig::set(key, value)?;
    println!("  {} {key} = {value}", "✓".green().bold());
    Ok(())
}
