// Live microphone endpoints and the SSE stream.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use axum::Json;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::live::sse_format;

use super::AppState;

#[derive(Deserialize)]
pub struct StreamParams {
    call_id: String,
}

/// SSE stream of transcription events for one call/session. Each subscriber
/// gets an initial `ping`, then the replay ring, then live events.
pub async fn stream_events(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> AppResult<Response> {
    if !state.settings.live_transcription {
        return Err(AppError::not_found("Live transcription is disabled"));
    }

    let ping = futures_util::stream::once(async {
        sse_format(Some("ping"), &json!({}))
    });
    let events = state.bus.subscribe(&params.call_id).map(|event| {
        let data = serde_json::to_value(&event).unwrap_or_else(|_| json!({}));
        sse_format(Some(event.event_type()), &data)
    });

    let body = Body::from_stream(
        ping.chain(events)
            .map(|frame| Ok::<Bytes, std::io::Error>(Bytes::from(frame))),
    );

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .map_err(|e| AppError::Internal(e.to_string()))
}

pub async fn start_session(State(state): State<AppState>) -> AppResult<Json<Value>> {
    ensure_live_mic(&state)?;
    let session_id = state.live.start().await?;
    Ok(Json(json!({ "session_id": session_id })))
}

#[derive(Deserialize)]
pub struct SessionParams {
    session_id: String,
}

pub async fn push_chunk(
    State(state): State<AppState>,
    Query(params): Query<SessionParams>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    ensure_live_mic(&state)?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let outcome = state
        .live
        .push(&params.session_id, body, content_type)
        .await?;
    Ok(Json(json!({ "chunk_index": outcome.chunk_index })))
}

pub async fn stop_session(
    State(state): State<AppState>,
    Query(params): Query<SessionParams>,
) -> AppResult<Json<Value>> {
    ensure_live_mic(&state)?;
    let outcome = state.live.stop(&params.session_id).await?;
    Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
}

fn ensure_live_mic(state: &AppState) -> AppResult<()> {
    if !state.settings.live_mic {
        return Err(AppError::not_found("Live microphone capture is disabled"));
    }
    Ok(())
}
