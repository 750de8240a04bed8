use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = overseer_core::cli::Cli::parse();

    // .env next to the binary is honoured when the working directory has none
    if dotenvy::dotenv().is_err() {
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let _ = dotenvy::from_path(dir.join(".env"));
            }
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,sqlx=warn")),
        )
        .init();

    overseer_core::cli::dispatch(cli.command).await
}
