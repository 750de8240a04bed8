pub mod autotune;
pub mod canary;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod control;
pub mod db;
pub mod evaluator;
pub mod events;
pub mod handlers;
pub mod live;
pub mod orchestrator;
pub mod population;
pub mod registry;
pub mod safety;
pub mod scoring;
pub mod test_utils;

use overseer_shared::OverseerError;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::control::ControlHandle;

pub struct AppState {
    pub control: ControlHandle,
    pub config: config::AppConfig,
}

pub enum AppError {
    Overseer(OverseerError),
    Internal(anyhow::Error),
    NotFound(String),
    Validation(String),
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, err_type, message) = match self {
            AppError::Overseer(e) => {
                let status = match &e {
                    OverseerError::PolicyNotFound(_) | OverseerError::ParentNotFound(_) => {
                        axum::http::StatusCode::NOT_FOUND
                    }
                    OverseerError::InvalidTransition { .. }
                    | OverseerError::DestructiveActionBlocked(_) => axum::http::StatusCode::CONFLICT,
                    OverseerError::Persistence(_) | OverseerError::Internal(_) => {
                        axum::http::StatusCode::INTERNAL_SERVER_ERROR
                    }
                    _ => axum::http::StatusCode::BAD_REQUEST,
                };
                let err_type = serde_json::to_value(&e)
                    .ok()
                    .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
                    .unwrap_or_else(|| "OverseerError".to_string());
                (status, err_type, e.to_string())
            }
            AppError::Internal(e) => {
                // Full error stays server-side
                tracing::error!("Internal error: {}", e);
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    "InternalError".to_string(),
                    "An internal error occurred".to_string(),
                )
            }
            AppError::NotFound(m) => (axum::http::StatusCode::NOT_FOUND, "NotFound".to_string(), m),
            AppError::Validation(m) => (
                axum::http::StatusCode::BAD_REQUEST,
                "ValidationError".to_string(),
                m,
            ),
        };

        let body = axum::Json(serde_json::json!({
            "status": "error",
            "error": {
                "type": err_type,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<OverseerError> for AppError {
    fn from(err: OverseerError) -> Self {
        AppError::Overseer(err)
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Control API route table.
pub fn router(state: Arc<AppState>) -> axum::Router {
    use axum::routing::{get, post};
    use tower_http::cors::CorsLayer;

    axum::Router::new()
        .route("/control/stop", post(handlers::stop_handler))
        .route("/control/pause", post(handlers::pause_handler))
        .route("/control/resume", post(handlers::resume_handler))
        .route("/health", get(handlers::health_handler))
        .route("/summary/latest", get(handlers::summary_handler))
        .with_state(state.clone())
        .layer(
            CorsLayer::new()
                .allow_origin(state.config.runtime.cors_origins.clone())
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                .allow_headers([axum::http::header::CONTENT_TYPE]),
        )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Run the loop without the HTTP control surface.
    pub no_api: bool,
}

/// Wires every component from `config` and drives the loop to completion.
pub async fn run_overseer(config: config::AppConfig, options: RunOptions) -> anyhow::Result<()> {
    use crate::checkpoint::{CheckpointStore, FileCheckpointStore, SqliteCheckpointStore};
    use crate::config::CheckpointBackend;
    use crate::evaluator::{select_backend, Evaluator};
    use crate::events::EventLog;
    use crate::live::{FileLiveEnvironment, LiveEnvironment};
    use crate::orchestrator::Orchestrator;
    use crate::registry::PolicyRegistry;
    use tracing::{info, warn};

    info!("+---------------------------------------+");
    info!("|           Overseer Tuning Loop        |");
    info!(
        "|             Version {:<10}        |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+---------------------------------------+");
    info!(
        "📍 State dir: {}, checkpoint backend: {:?}",
        config.runtime.state_dir.display(),
        config.runtime.checkpoint_backend
    );

    std::fs::create_dir_all(&config.runtime.state_dir).map_err(|e| {
        anyhow::anyhow!(
            "Failed to create state dir {}: {}",
            config.runtime.state_dir.display(),
            e
        )
    })?;

    // 1. Storage
    let pool = db::connect(&config.runtime.database_url).await?;
    db::init_db(&pool).await?;
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

    // 2. Evaluation
    let backend = select_backend(&config.sim)?;
    let seed = config.runtime.seed.unwrap_or_else(rand::random);
    let evaluator = Evaluator::new(
        backend.clone(),
        config.runtime.max_parallel_workers,
        config.knobs.clone(),
        seed,
    );
    let live: Option<Arc<dyn LiveEnvironment>> = if config.live.enabled {
        info!(signal = %config.live.signal_file.display(), "Live canary mode");
        Some(Arc::new(FileLiveEnvironment::new(&config.live)))
    } else {
        info!("Shadow canary mode");
        None
    };

    // 3. Control surface
    let control = ControlHandle::new(backend.kind());
    let server_shutdown = Arc::new(Notify::new());
    let server = if options.no_api {
        None
    } else {
        let state = Arc::new(AppState {
            control: control.clone(),
            config: config.clone(),
        });
        let app = router(state);
        let addr = format!("{}:{}", config.runtime.bind_address, config.runtime.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind control API on {}: {}", addr, e))?;
        info!("🚀 Control API listening on http://{}", addr);
        let shutdown = server_shutdown.clone();
        Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown.notified().await;
                })
                .await
        }))
    };

    let ctrl_c_control = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Interrupt received, stopping after the current generation");
            ctrl_c_control.request_stop().await;
        }
    });

    // 4. Loop
    let orchestrator = Orchestrator::new(config, store, registry, evaluator, live, control);
    let result = orchestrator.run().await;

    server_shutdown.notify_one();
    if let Some(handle) = server {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Control API exited with error: {}", e),
            Err(e) => warn!("Control API task failed: {}", e),
        }
    }
    pool.close().await;

    let checkpoint = result?;
    info!(
        loop_cursor = checkpoint.loop_cursor,
        active_policy_id = ?checkpoint.active_policy_id,
        "Overseer exited cleanly"
    );
    Ok(())
}
