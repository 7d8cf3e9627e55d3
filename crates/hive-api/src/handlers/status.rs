use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use hive_services::{ControlCommand, MeshStatus};

use super::{ask, ApiState};

// ── /status ──────────────────────────────────────────────────────────────────

pub async fn handle_status(
    State(state): State<ApiState>,
) -> Result<Json<MeshStatus>, (StatusCode, String)> {
    let status = ask(&state, |reply| ControlCommand::Status { reply }).await?;
    Ok(Json(status))
}

// ── /daemon/shutdown ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());
    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}
