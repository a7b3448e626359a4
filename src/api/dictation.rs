// Dictation endpoints: short snippet transcription and model warmup.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::AppResult;

use super::AppState;

#[derive(Deserialize)]
pub struct DictationSnippet {
    audio_base64: String,
    media_type: Option<String>,
}

pub async fn transcribe_snippet(
    State(state): State<AppState>,
    Json(request): Json<DictationSnippet>,
) -> AppResult<Json<Value>> {
    let result = state
        .dictation
        .transcribe_snippet(&request.audio_base64, request.media_type.as_deref())
        .await?;
    Ok(Json(serde_json::to_value(result).unwrap_or_default()))
}

pub async fn warmup(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let loaded = state.dictation.is_ready().await;
    Ok(Json(json!({
        "status": "ok",
        "whisper_loaded": loaded,
    })))
}
