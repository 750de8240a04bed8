use axum::{extract::State, Json};
use serde::Deserialize;
use std::sync::Arc;

use crate::{AppError, AppResult, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct PauseRequest {
    pub reason: Option<String>,
}

fn changed(changed: bool) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "changed": changed }))
}

/// **Route:** `POST /control/stop`
///
/// The loop finishes the generation in flight, persists and exits.
pub async fn stop_handler(State(state): State<Arc<AppState>>) -> AppResult<Json<serde_json::Value>> {
    Ok(changed(state.control.request_stop().await))
}

/// **Route:** `POST /control/pause`
///
/// Optional body `{"reason": "..."}`. Pausing twice is a no-op.
pub async fn pause_handler(
    State(state): State<Arc<AppState>>,
    body: Option<Json<PauseRequest>>,
) -> AppResult<Json<serde_json::Value>> {
    let reason = body.and_then(|Json(req)| req.reason);
    if let Some(r) = &reason {
        if r.len() > 512 {
            return Err(AppError::Validation(
                "reason must be at most 512 bytes".to_string(),
            ));
        }
    }
    Ok(changed(state.control.request_pause(reason).await))
}

/// **Route:** `POST /control/resume`
///
/// Clears safe-pause at the next generation boundary. Failure counters are kept.
pub async fn resume_handler(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<serde_json::Value>> {
    Ok(changed(state.control.request_resume().await))
}

/// **Route:** `GET /health`
pub async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<serde_json::Value>> {
    let health = state.control.snapshot_health().await;
    let value = serde_json::to_value(health).map_err(|e| AppError::Internal(e.into()))?;
    Ok(Json(value))
}

/// **Route:** `GET /summary/latest`
///
/// 404 until the first generation has completed.
pub async fn summary_handler(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<serde_json::Value>> {
    let summary = state
        .control
        .snapshot_summary()
        .await
        .ok_or_else(|| AppError::NotFound("no generation has completed yet".to_string()))?;
    let value = serde_json::to_value(summary).map_err(|e| AppError::Internal(e.into()))?;
    Ok(Json(value))
}
