// Standalone upload surface: store the file and create the call row without
// running the pipeline.

use axum::extract::{Multipart, Path, State};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use crate::db::models::NewCall;
use crate::db::repositories::CallsRepository;
use crate::error::{AppError, AppResult};

use super::AppState;

pub async fn upload_audio(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<serde_json::Value>> {
    let field = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("invalid multipart body: {e}")))?
        .ok_or_else(|| AppError::Validation("Missing file field".into()))?;

    let filename = field
        .file_name()
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation("Missing filename".into()))?;

    let call_id = Uuid::new_v4().to_string();
    let saved = state
        .uploads
        .save_stream(&call_id, &filename, super::field_stream(field))
        .await?;

    let duration = state
        .audio
        .analyze(&saved.file_path)
        .await
        .ok()
        .map(|a| a.duration_seconds);

    CallsRepository::create(
        state.db.pool(),
        &NewCall {
            call_id: call_id.clone(),
            file_path: saved.file_path.display().to_string(),
            original_filename: saved.original_filename.clone(),
            file_size_bytes: saved.size_bytes as i64,
            duration,
        },
    )
    .await?;

    Ok(Json(json!({
        "message": "Audio file uploaded successfully",
        "call_id": call_id,
        "status": "uploaded",
        "file_info": {
            "original_filename": saved.original_filename,
            "file_size": saved.size_bytes,
            "file_extension": saved.extension,
        },
    })))
}

pub async fn list_calls(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let calls = CallsRepository::list_all(state.db.pool()).await?;
    Ok(Json(json!({
        "total": calls.len(),
        "calls": calls,
    })))
}

pub async fn call_status(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let call = CallsRepository::get(state.db.pool(), &call_id)
        .await?
        .ok_or_else(|| AppError::not_found("Call not found"))?;

    Ok(Json(json!({
        "call_id": call.call_id,
        "status": call.status,
        "error": call.error,
        "duration": call.duration,
        "created_at": call.created_at,
        "updated_at": call.updated_at,
    })))
}
