//! /results: finished outputs of the current batch.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use hive_core::TaskId;
use hive_services::ResultSummary;

use super::ApiState;

#[derive(Serialize)]
pub struct ResultsResponse {
    pub results: Vec<ResultSummary>,
}

pub async fn handle_results(State(state): State<ApiState>) -> Json<ResultsResponse> {
    Json(ResultsResponse {
        results: state.results.list(),
    })
}

pub async fn handle_result_download(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> Result<Response, (StatusCode, String)> {
    let result = state
        .results
        .get(&TaskId::new(task_id.clone()))
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no result for {task_id}")))?;

    let disposition = format!("attachment; filename=\"{}\"", result.name);
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        result.output,
    )
        .into_response())
}
