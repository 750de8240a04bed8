mod cli;
mod client;
mod commands;
mod config;
mod error;
mod output;

use clap::Parser;

use crate::config::CliConfig;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();
    let json_mode = cli.json;
    // Unreadable config still gets reported against the default endpoint
    let endpoint = CliConfig::load().map_or_else(|_| CliConfig::default().url, |c| c.url);

    if let Err(e) = commands::dispatch(cli).await {
        let code = if json_mode {
            let hint = error::classify(&e);
            let body = serde_json::json!({
                "error": format!("{e:#}"),
                "hint": hint.as_ref().map(|h| format!("{h:?}")),
                "endpoint": endpoint,
            });
            println!("{body}");
            hint.map_or(1, |h| h.exit_code())
        } else {
            error::display_error(&e, &endpoint)
        };
        std::process::exit(code);
    }
}
