// Thin HTTP surface over the service components. Handlers translate the
// error taxonomy into status codes and keep bodies free of internals.

mod dictation;
mod live;
mod models;
mod monitor;
mod pipeline;
mod upload;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;

use crate::audio::AudioProcessor;
use crate::config::Settings;
use crate::db::Database;
use crate::dictation::DictationService;
use crate::error::{AppError, AppResult};
use crate::live::{EventBus, LiveSessionManager};
use crate::models::ModelManager;
use crate::nlp::NlpProcessor;
use crate::pipeline::{PipelineMonitor, PipelineOrchestrator};
use crate::upload::UploadHandler;
use crate::whisper::WhisperClient;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: Database,
    pub audio: Arc<AudioProcessor>,
    pub whisper: Arc<WhisperClient>,
    pub bus: Arc<EventBus>,
    pub monitor: Arc<PipelineMonitor>,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub live: Arc<LiveSessionManager>,
    pub models: Arc<ModelManager>,
    pub nlp: Arc<NlpProcessor>,
    pub uploads: Arc<UploadHandler>,
    pub dictation: Arc<DictationService>,
}

impl AppState {
    pub fn new(settings: Arc<Settings>, db: Database) -> Self {
        let audio = Arc::new(AudioProcessor::new());
        let whisper = Arc::new(WhisperClient::new(&settings));
        let bus = Arc::new(EventBus::new());
        let monitor = Arc::new(PipelineMonitor::new());
        let nlp = Arc::new(NlpProcessor::new());

        let orchestrator = Arc::new(PipelineOrchestrator::new(
            settings.clone(),
            audio.clone(),
            whisper.clone(),
            nlp.clone(),
            db.clone(),
            monitor.clone(),
            bus.clone(),
        ));
        let live = Arc::new(LiveSessionManager::new(
            settings.clone(),
            audio.clone(),
            whisper.clone(),
            bus.clone(),
            nlp.clone(),
            db.clone(),
        ));
        let models = Arc::new(ModelManager::new(settings.clone(), whisper.clone()));
        let uploads = Arc::new(UploadHandler::new(settings.clone()));
        let dictation = Arc::new(DictationService::new(
            settings.clone(),
            audio.clone(),
            whisper.clone(),
        ));

        Self {
            settings,
            db,
            audio,
            whisper,
            bus,
            monitor,
            orchestrator,
            live,
            models,
            nlp,
            uploads,
            dictation,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.settings.max_upload_bytes as usize + 1024 * 1024;

    let api = Router::new()
        .route("/upload", post(upload::upload_audio))
        .route("/calls", get(upload::list_calls))
        .route("/calls/:call_id/status", get(upload::call_status))
        .route("/pipeline/upload", post(pipeline::pipeline_upload))
        .route(
            "/pipeline/results",
            get(pipeline::list_results).delete(pipeline::clear_results),
        )
        .route(
            "/pipeline/results/:call_id",
            get(pipeline::result_detail).delete(pipeline::delete_result),
        )
        .route(
            "/pipeline/results/:call_id/export",
            get(pipeline::export_result),
        )
        .route("/pipeline/reanalyze/:call_id", post(pipeline::reanalyze))
        .route("/transcription/stream", get(live::stream_events))
        .route("/live/start", post(live::start_session))
        .route("/live/chunk", post(live::push_chunk))
        .route("/live/stop", post(live::stop_session))
        .route("/dictation/transcribe", post(dictation::transcribe_snippet))
        .route("/dictation/warmup", post(dictation::warmup))
        .route("/models", get(models::list_models))
        .route("/models/download", post(models::download_model))
        .route("/models/select", post(models::select_model))
        .route("/monitor/active", get(monitor::active))
        .route("/monitor/history", get(monitor::history))
        .route("/monitor/performance", get(monitor::performance))
        .route("/monitor/alerts", get(monitor::alerts));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Adapt a multipart field into the byte stream the upload handler expects.
pub(crate) fn field_stream(
    field: axum::extract::multipart::Field<'_>,
) -> impl futures_util::Stream<
    Item = Result<bytes::Bytes, axum::extract::multipart::MultipartError>,
> + Unpin
       + '_ {
    Box::pin(futures_util::stream::unfold(field, |mut field| async move {
        match field.chunk().await {
            Ok(Some(bytes)) => Some((Ok(bytes), field)),
            Ok(None) => None,
            Err(e) => Some((Err(e), field)),
        }
    }))
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "message": "TranscriptAI speech intelligence service",
        "status": "running",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn health(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    sqlx::query("SELECT 1")
        .execute(state.db.pool())
        .await
        .map_err(|e| AppError::Internal(format!("database unhealthy: {e}")))?;

    Ok(Json(json!({
        "status": "healthy",
        "database": "connected",
        "features": {
            "live_transcription": state.settings.live_transcription,
            "live_mic": state.settings.live_mic,
            "live_mic_batch_only": state.settings.live_batch_only,
        },
        "models": {
            "whisper": state.whisper.health().await,
            "active": state.models.active_model().await,
        },
        "timestamp": Utc::now().to_rfc3339(),
    })))
}
