// TranscriptAI: local-first speech intelligence over a co-located
// whisper.cpp server. Audio comes in as uploads or live microphone chunks;
// persisted transcripts and rule-based analysis come out, with progressive
// results streamed over SSE.

pub mod api;
pub mod audio;
pub mod config;
pub mod db;
pub mod dictation;
pub mod error;
pub mod export;
pub mod live;
pub mod models;
pub mod nlp;
pub mod pipeline;
pub mod upload;
pub mod whisper;

use std::sync::Arc;
use std::time::Duration;

pub use api::{router, AppState};
pub use config::Settings;

/// Build the shared application state: directories, database, components.
pub async fn bootstrap(settings: Settings) -> anyhow::Result<AppState> {
    let settings = Arc::new(settings);

    for dir in [
        settings.data_dir.clone(),
        settings.upload_dir(),
        settings.processed_dir(),
        settings.transcripts_dir(),
        settings.live_sessions_dir(),
        settings.user_models_dir(),
    ] {
        tokio::fs::create_dir_all(&dir).await?;
    }

    let db = db::Database::connect(&settings.database_path()).await?;
    Ok(AppState::new(settings, db))
}

/// Background warmup: poll the transcription server until it is ready so the
/// first request does not pay the cold-start wait. Never fails the process.
pub fn spawn_warmup(state: &AppState) -> tokio::task::JoinHandle<()> {
    let whisper = state.whisper.clone();
    tokio::spawn(async move {
        log::info!("[warmup] whisper probe started");
        if whisper.ensure_ready(30, Duration::from_secs(2)).await {
            log::info!("[warmup] whisper server is ready");
        } else {
            log::warn!("[warmup] whisper server not reachable; requests will report it offline");
        }
    })
}
