// Model management endpoints.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::AppResult;
use crate::models::{DownloadOutcome, ModelInfo};

use super::AppState;

pub async fn list_models(State(state): State<AppState>) -> AppResult<Json<Vec<ModelInfo>>> {
    Ok(Json(state.models.list().await))
}

#[derive(Deserialize)]
pub struct ModelRequest {
    name: String,
}

pub async fn download_model(
    State(state): State<AppState>,
    Json(request): Json<ModelRequest>,
) -> AppResult<Json<Value>> {
    let outcome = state.models.download(&request.name).await?;
    let status = match outcome {
        DownloadOutcome::Downloaded => "downloaded",
        DownloadOutcome::DownloadStarted => "download_started",
    };
    Ok(Json(json!({ "status": status, "model": request.name })))
}

pub async fn select_model(
    State(state): State<AppState>,
    Json(request): Json<ModelRequest>,
) -> AppResult<Json<Value>> {
    let outcome = state.models.select(&request.name).await?;
    Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
}
