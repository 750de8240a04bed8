use clap::{Parser, Subcommand};
use overseer_shared::{Phase, RunEvent};
use std::sync::Arc;

use crate::checkpoint::{CheckpointStore, FileCheckpointStore, SqliteCheckpointStore};
use crate::config::{AppConfig, CheckpointBackend};
use crate::events::EventLog;
use crate::registry::PolicyRegistry;
use crate::safety::SafetyBreaker;

#[derive(Parser)]
#[command(
    name = "overseer",
    version = env!("CARGO_PKG_VERSION"),
    about = "Overseer - continuous policy tuning loop"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the tuning loop (default)
    Run {
        /// Stop after this many generations (overrides OVERSEER_MAX_GENERATIONS)
        #[arg(long)]
        max_generations: Option<u64>,
        /// Do not start the HTTP control API
        #[arg(long)]
        no_api: bool,
    },
    /// Print the persisted checkpoint and active policy
    Status,
    /// Print the ancestry of a policy, nearest first
    Lineage {
        policy_id: String,
    },
    /// Clear safe-pause in the persisted checkpoint (loop must not be running)
    Resume,
    /// Print version information
    Version,
}

pub async fn dispatch(command: Option<Commands>) -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    match command.unwrap_or(Commands::Run {
        max_generations: None,
        no_api: false,
    }) {
        Commands::Run {
            max_generations,
            no_api,
        } => {
            let mut config = config;
            if max_generations.is_some() {
                config.runtime.max_generations = max_generations;
            }
            crate::run_overseer(config, crate::RunOptions { no_api }).await
        }
        Commands::Status => status_command(&config).await,
        Commands::Lineage { policy_id } => lineage_command(&config, &policy_id).await,
        Commands::Resume => resume_command(&config).await,
        Commands::Version => {
            println!("Overseer v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

struct Offline {
    pool: sqlx::SqlitePool,
    store: Arc<dyn CheckpointStore>,
    registry: PolicyRegistry,
}

async fn open_offline(config: &AppConfig) -> anyhow::Result<Offline> {
    let pool = crate::db::connect(&config.runtime.database_url).await?;
    crate::db::init_db(&pool).await?;
    let events = EventLog::spawn(config.runtime.events_file.clone());
    let store: Arc<dyn CheckpointStore> = match config.runtime.checkpoint_backend {
        CheckpointBackend::Sqlite => Arc::new(SqliteCheckpointStore::new(pool.clone(), events)),
        CheckpointBackend::File => Arc::new(FileCheckpointStore::new(
            config.runtime.state_dir.join("checkpoint.json"),
            events,
        )),
    };
    let registry = PolicyRegistry::new(
        pool.clone(),
        config.runtime.state_dir.join("policies"),
        config.canary.ewma_alpha,
    );
    Ok(Offline {
        pool,
        store,
        registry,
    })
}

async fn status_command(config: &AppConfig) -> anyhow::Result<()> {
    let offline = open_offline(config).await?;
    let Some(cp) = offline.store.load().await? else {
        println!("No checkpoint at {}", offline.store.describe());
        offline.pool.close().await;
        return Ok(());
    };
    let active = offline.registry.get_active().await?;

    println!("Checkpoint:       {}", offline.store.describe());
    println!("Generation:       {}", cp.loop_cursor);
    println!(
        "Active policy:    {}",
        active
            .as_ref()
            .map_or("-".to_string(), |p| p.policy_id.clone())
    );
    if let Some(score) = active.as_ref().and_then(|p| p.score) {
        println!("Active score:     {:.4}", score);
    }
    println!("Population:       {}", cp.population_state.population.len());
    if let Some(best) = cp.population_state.population.best() {
        println!("Best candidate:   {} ({:.4})", best.policy_id, best.score);
    }
    match &cp.population_state.canary {
        Some(run) => println!(
            "Canary:           {} ({} windows, {} observed)",
            run.policy_id, run.windows_elapsed, run.windows_observed
        ),
        None => println!("Canary:           -"),
    }
    if cp.safe_pause {
        println!(
            "Safe-pause:       yes ({})",
            cp.safe_pause_reason.as_deref().unwrap_or("unknown")
        );
    } else {
        println!("Safe-pause:       no");
    }
    if let Some(ts) = cp.last_success_ts {
        println!("Last success:     {}", ts.to_rfc3339());
    }
    offline.pool.close().await;
    Ok(())
}

async fn lineage_command(config: &AppConfig, policy_id: &str) -> anyhow::Result<()> {
    let offline = open_offline(config).await?;
    let chain = offline.registry.lineage(policy_id).await?;
    for (depth, policy) in chain.iter().enumerate() {
        println!(
            "{:>3}  {:<24} {:<12} score={}",
            depth,
            policy.policy_id,
            policy.promotion_state.as_str(),
            policy
                .score
                .map_or("-".to_string(), |s| format!("{:.4}", s))
        );
    }
    offline.pool.close().await;
    Ok(())
}

async fn resume_command(config: &AppConfig) -> anyhow::Result<()> {
    let offline = open_offline(config).await?;
    let Some(mut cp) = offline.store.load().await? else {
        anyhow::bail!("No checkpoint at {}", offline.store.describe());
    };
    if !cp.safe_pause {
        println!("Loop is not paused");
        offline.pool.close().await;
        return Ok(());
    }
    let reason = cp.safe_pause_reason.clone();
    SafetyBreaker::resume(&mut cp);
    offline.store.save(&cp).await?;
    offline.store.append_event(RunEvent::info(
        Phase::Control,
        "control_resume",
        serde_json::json!({"reason": reason, "offline": true}),
    ));
    offline.store.flush_events().await;
    println!("Safe-pause cleared (was: {})", reason.as_deref().unwrap_or("unknown"));
    offline.pool.close().await;
    Ok(())
}
