// Observability endpoints over the pipeline monitor.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::AppResult;

use super::AppState;

pub async fn active(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let pipelines = state.monitor.active();
    Ok(Json(json!({
        "count": pipelines.len(),
        "pipelines": pipelines,
    })))
}

#[derive(Deserialize)]
pub struct HistoryParams {
    limit: Option<usize>,
}

pub async fn history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> AppResult<Json<Value>> {
    let records = state.monitor.history(params.limit.unwrap_or(50));
    Ok(Json(json!({
        "count": records.len(),
        "history": records,
    })))
}

pub async fn performance(State(state): State<AppState>) -> AppResult<Json<Value>> {
    Ok(Json(state.monitor.performance_summary()))
}

pub async fn alerts(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let alerts = state.monitor.recent_alerts(100);
    Ok(Json(json!({
        "count": alerts.len(),
        "alerts": alerts,
    })))
}
