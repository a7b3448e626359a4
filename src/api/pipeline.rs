// Full-pipeline endpoints plus results browsing, export and re-analysis.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::db::repositories::{ResultRow, ResultsQuery, ResultsRepository, TranscriptsRepository};
use crate::error::{AppError, AppResult};
use crate::export::{self, ExportFormat};

use super::AppState;

pub async fn pipeline_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<Value>> {
    let field = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("invalid multipart body: {e}")))?
        .ok_or_else(|| AppError::Validation("Missing file field".into()))?;

    let filename = field
        .file_name()
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation("Missing filename".into()))?;

    let outcome = state
        .orchestrator
        .process_upload(&filename, super::field_stream(field))
        .await?;
    Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
}

pub async fn list_results(
    State(state): State<AppState>,
    Query(query): Query<ResultsQuery>,
) -> AppResult<Json<Value>> {
    let page = ResultsRepository::list(state.db.pool(), &query).await?;
    Ok(Json(json!({
        "results": page.results.iter().map(result_to_json).collect::<Vec<_>>(),
        "total": page.total,
        "page": page.page,
        "page_size": page.page_size,
    })))
}

pub async fn result_detail(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> AppResult<Json<Value>> {
    let row = ResultsRepository::detail(state.db.pool(), &call_id)
        .await?
        .ok_or_else(|| AppError::not_found("Call not found"))?;
    Ok(Json(result_to_json(&row)))
}

pub async fn delete_result(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> AppResult<Json<Value>> {
    let deleted = ResultsRepository::delete(
        state.db.pool(),
        &call_id,
        &state.settings.processed_dir(),
    )
    .await?;
    if !deleted {
        return Err(AppError::not_found("Call not found"));
    }
    Ok(Json(json!({ "ok": true, "call_id": call_id })))
}

pub async fn clear_results(State(state): State<AppState>) -> AppResult<Json<Value>> {
    ResultsRepository::clear_all(state.db.pool(), &state.settings.upload_dir()).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(serde::Deserialize)]
pub struct ExportParams {
    format: Option<String>,
}

pub async fn export_result(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
    Query(params): Query<ExportParams>,
) -> AppResult<Response> {
    let format = ExportFormat::parse(params.format.as_deref().unwrap_or("txt"))?;

    let transcript = TranscriptsRepository::get_by_call(state.db.pool(), &call_id)
        .await?
        .ok_or_else(|| AppError::not_found("No transcript for this call"))?;

    let filename = ResultsRepository::detail(state.db.pool(), &call_id)
        .await?
        .and_then(|row| row.original_filename);

    let exported = export::export(&transcript.text, format, filename.as_deref())?;

    Ok((
        [
            (header::CONTENT_TYPE, exported.content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", exported.suggested_filename),
            ),
        ],
        exported.bytes,
    )
        .into_response())
}

pub async fn reanalyze(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> AppResult<Json<Value>> {
    let outcome = state.orchestrator.reanalyze(&call_id).await?;
    Ok(Json(json!({
        "call_id": call_id,
        "analysis": outcome,
    })))
}

/// Rows carry keywords/topics as JSON text; decode them for the wire.
fn result_to_json(row: &ResultRow) -> Value {
    let mut value = serde_json::to_value(row).unwrap_or_default();
    if let Value::Object(map) = &mut value {
        for key in ["keywords", "topics"] {
            let decoded = map
                .get(key)
                .and_then(|v| v.as_str())
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                .unwrap_or(Value::Null);
            map.insert(key.to_string(), decoded);
        }
    }
    value
}
