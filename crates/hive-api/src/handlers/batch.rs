//! /batch: submit files for processing.

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;

use hive_services::{BatchReceipt, ControlCommand, SubmittedFile};

use super::{ask, ApiState};

pub async fn handle_submit_batch(
    State(state): State<ApiState>,
    mut multipart: Multipart,
) -> Result<Json<BatchReceipt>, (StatusCode, String)> {
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        let name = sanitize_filename(field.file_name().or(field.name()).unwrap_or(""));
        let payload = field
            .bytes()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
        if payload.is_empty() {
            continue;
        }
        files.push(SubmittedFile { name, payload });
    }

    if files.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "no file data".to_string()));
    }

    let count = files.len();
    let receipt = ask(&state, |reply| ControlCommand::SubmitBatch { files, reply }).await?;
    tracing::info!(files = count, batch_total = receipt.batch_total, "batch submitted via API");
    Ok(Json(receipt))
}

/// Reduce a client-supplied name to a safe final path component.
pub(crate) fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let trimmed = base.trim_start_matches('.');

    let clean: String = trimmed
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if clean.is_empty() {
        "task".to_string()
    } else {
        clean
    }
}
