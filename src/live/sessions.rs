// Live microphone sessions over a stateless HTTP surface.
//
// A session is an ordered set of recorder chunks on disk. Chunk 0 carries the
// container header; later chunks are headerless clusters and only decode when
// concatenated behind chunk 0. Progressive mode transcribes per chunk and
// publishes partials; batch mode defers all transcription to stop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::audio::AudioProcessor;
use crate::config::Settings;
use crate::db::models::{CallStatus, NewCall};
use crate::db::repositories::{AnalysesRepository, CallsRepository, TranscriptsRepository};
use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::live::{EventBus, LiveEvent};
use crate::nlp::NlpProcessor;
use crate::whisper::{TranscribeOptions, WhisperClient};

/// Stop waits at most this long for in-flight pushes to settle.
const QUIESCENCE_BUDGET: Duration = Duration::from_millis(1500);
const QUIESCENCE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize)]
pub struct PushOutcome {
    pub chunk_index: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub final_text: String,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

struct LiveSession {
    session_id: String,
    dir: PathBuf,
    chunks: Vec<PathBuf>,
    /// Per-chunk emitted text, parallel to `chunks`.
    partials: Vec<String>,
    /// Full text of chunk 0, used to strip the prefix from later chunks.
    baseline: Option<String>,
    extension: &'static str,
    #[allow(dead_code)]
    started_at: DateTime<Utc>,
}

pub struct LiveSessionManager {
    settings: Arc<Settings>,
    audio: Arc<AudioProcessor>,
    whisper: Arc<WhisperClient>,
    bus: Arc<EventBus>,
    nlp: Arc<NlpProcessor>,
    db: Database,
    sessions: DashMap<String, Arc<Mutex<LiveSession>>>,
}

impl LiveSessionManager {
    pub fn new(
        settings: Arc<Settings>,
        audio: Arc<AudioProcessor>,
        whisper: Arc<WhisperClient>,
        bus: Arc<EventBus>,
        nlp: Arc<NlpProcessor>,
        db: Database,
    ) -> Self {
        Self {
            settings,
            audio,
            whisper,
            bus,
            nlp,
            db,
            sessions: DashMap::new(),
        }
    }

    /// Open a session with a fresh working directory.
    pub async fn start(&self) -> AppResult<String> {
        let session_id = Uuid::new_v4().to_string();
        let dir = self.settings.live_sessions_dir().join(&session_id);
        tokio::fs::create_dir_all(&dir).await?;

        self.sessions.insert(
            session_id.clone(),
            Arc::new(Mutex::new(LiveSession {
                session_id: session_id.clone(),
                dir,
                chunks: Vec::new(),
                partials: Vec::new(),
                baseline: None,
                extension: "webm",
                started_at: Utc::now(),
            })),
        );
        log::info!("live session started: {session_id}");
        Ok(session_id)
    }

    /// Append one recorder chunk. In progressive mode the chunk is
    /// transcribed inline (under the per-session lock, which keeps partial
    /// publication in chunk order); failures are acknowledged silently.
    pub async fn push(
        &self,
        session_id: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> AppResult<PushOutcome> {
        let session = self
            .sessions
            .get(session_id)
            .map(|s| s.clone())
            .ok_or_else(|| AppError::not_found("Session not found"))?;

        let mut guard = session.lock().await;
        if guard.chunks.is_empty() {
            guard.extension = chunk_extension(content_type);
        }
        let index = guard.chunks.len();
        let chunk_path = guard
            .dir
            .join(format!("chunk_{index:05}.{}", guard.extension));
        tokio::fs::write(&chunk_path, &data).await?;
        guard.chunks.push(chunk_path);
        guard.partials.push(String::new());

        if self.progressive_mode() {
            self.process_chunk(&mut guard, index).await;
        }

        Ok(PushOutcome {
            chunk_index: index as u64,
        })
    }

    /// Transcribe one chunk and publish the newly heard text. Any failure
    /// publishes nothing; the push is still acknowledged.
    async fn process_chunk(&self, session: &mut LiveSession, index: usize) {
        let wav_path = session.dir.join(format!("partial_{index:05}.wav"));
        let mut scratch: Option<PathBuf> = None;

        let source = if index == 0 {
            session.chunks[0].clone()
        } else {
            // Headerless cluster: decode behind chunk 0's header.
            let combined = session
                .dir
                .join(format!("combined_{index:05}.{}", session.extension));
            let inputs = vec![session.chunks[0].clone(), session.chunks[index].clone()];
            if let Err(e) = self.audio.concat_chunks(&inputs, &combined).await {
                log::warn!("chunk {index} concat failed for {}: {e}", session.session_id);
                return;
            }
            scratch = Some(combined.clone());
            combined
        };

        let transcode = self.audio.convert_to_wav(&source, &wav_path).await;
        if let Some(combined) = &scratch {
            let _ = tokio::fs::remove_file(combined).await;
        }
        if let Err(e) = transcode {
            log::warn!(
                "chunk {index} transcode failed for {}: {e}",
                session.session_id
            );
            return;
        }

        let opts = TranscribeOptions {
            language: self.settings.force_language.clone(),
            ..Default::default()
        };
        let outcome = self.whisper.transcribe(&wav_path, &opts).await;
        let _ = tokio::fs::remove_file(&wav_path).await;

        if !outcome.ok {
            log::warn!(
                "chunk {index} transcription failed for {}: {}",
                session.session_id,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
            return;
        }

        let full_text = outcome.text.trim().to_string();
        let new_text = if index == 0 {
            session.baseline = Some(full_text.clone());
            full_text
        } else {
            strip_baseline(&full_text, session.baseline.as_deref())
        };

        session.partials[index] = new_text.clone();
        self.bus.publish(
            &session.session_id,
            LiveEvent::Partial {
                call_id: session.session_id.clone(),
                chunk_index: index as u64,
                text: new_text,
                start_sec: None,
                end_sec: None,
            },
        );
    }

    /// Finalize: wait for pushes to settle, assemble the container, produce
    /// the final transcript, persist, publish `complete`, tear down.
    /// The response is returned only after persistence finished.
    pub async fn stop(&self, session_id: &str) -> AppResult<StopOutcome> {
        let session = self
            .sessions
            .get(session_id)
            .map(|s| s.clone())
            .ok_or_else(|| AppError::not_found("Session not found"))?;

        self.wait_for_quiescence(&session).await;
        // New pushes for this session 404 from here on.
        self.sessions.remove(session_id);

        let guard = session.lock().await;
        let result = self.finalize(&guard).await;

        if let Err(e) = tokio::fs::remove_dir_all(&guard.dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove session dir {}: {e}", guard.dir.display());
            }
        }
        result
    }

    /// Chunk count must hold still for one poll interval before we finalize.
    async fn wait_for_quiescence(&self, session: &Arc<Mutex<LiveSession>>) {
        let deadline = tokio::time::Instant::now() + QUIESCENCE_BUDGET;
        let mut last_count = session.lock().await.chunks.len();
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(QUIESCENCE_POLL).await;
            let count = session.lock().await.chunks.len();
            if count == last_count {
                return;
            }
            last_count = count;
        }
    }

    async fn finalize(&self, session: &LiveSession) -> AppResult<StopOutcome> {
        if session.chunks.is_empty() {
            log::info!("live session {} stopped with no audio", session.session_id);
            self.bus.complete(&session.session_id);
            return Ok(StopOutcome {
                final_text: String::new(),
                duration_seconds: 0.0,
                call_id: None,
            });
        }

        let dated = Utc::now().format("%Y/%m/%d").to_string();
        let container = self
            .settings
            .upload_dir()
            .join(dated)
            .join(format!("{}.{}", session.session_id, session.extension));
        self.audio
            .concat_chunks(&session.chunks, &container)
            .await
            .map_err(|e| AppError::Internal(format!("failed to assemble session audio: {e}")))?;

        let (final_text, language) = if self.progressive_mode() {
            let text = session
                .partials
                .iter()
                .filter(|p| !p.is_empty())
                .cloned()
                .collect::<Vec<_>>()
                .join(" ");
            (text, self.settings.force_language.clone())
        } else {
            self.transcribe_batch(session, &container).await
        };

        let analysis = self.audio.analyze(&container).await.ok();
        let duration = analysis.as_ref().map(|a| a.duration_seconds).unwrap_or(0.0);
        let file_size = tokio::fs::metadata(&container)
            .await
            .map(|m| m.len() as i64)
            .unwrap_or(0);

        let pool = self.db.pool();
        CallsRepository::create(
            pool,
            &NewCall {
                call_id: session.session_id.clone(),
                file_path: container.display().to_string(),
                original_filename: format!("live_{}.{}", session.session_id, session.extension),
                file_size_bytes: file_size,
                duration: Some(duration),
            },
        )
        .await?;

        TranscriptsRepository::store(
            pool,
            &session.session_id,
            &final_text,
            language.as_deref(),
            0,
        )
        .await?;

        if !final_text.trim().is_empty() {
            let outcome = self.nlp.analyze(&final_text);
            AnalysesRepository::insert(pool, &session.session_id, &outcome.to_new_analysis())
                .await?;
        }

        if let Some(analysis) = &analysis {
            CallsRepository::update_audio_summary(
                pool,
                &session.session_id,
                Some(analysis.duration_seconds),
                Some(&analysis.format),
                Some(analysis.sample_rate as i64),
                Some(analysis.channels as i64),
            )
            .await?;
        }
        CallsRepository::update_status(pool, &session.session_id, CallStatus::Completed, None)
            .await?;

        // Harmless when nobody is subscribed.
        self.bus.complete(&session.session_id);
        log::info!(
            "live session {} finalized ({} chunks, {:.1}s)",
            session.session_id,
            session.chunks.len(),
            duration
        );

        Ok(StopOutcome {
            final_text,
            duration_seconds: duration,
            call_id: Some(session.session_id.clone()),
        })
    }

    /// Batch-on-stop: one transcode, one transcription over the assembled
    /// container. Failures degrade to an empty transcript rather than losing
    /// the recording.
    async fn transcribe_batch(
        &self,
        session: &LiveSession,
        container: &std::path::Path,
    ) -> (String, Option<String>) {
        let wav = session.dir.join("final.wav");
        if let Err(e) = self.audio.convert_to_wav(container, &wav).await {
            log::error!(
                "final transcode failed for session {}: {e}",
                session.session_id
            );
            return (String::new(), self.settings.force_language.clone());
        }

        let opts = TranscribeOptions {
            language: self.settings.force_language.clone(),
            ..Default::default()
        };
        let outcome = self.whisper.transcribe(&wav, &opts).await;
        let _ = tokio::fs::remove_file(&wav).await;

        if !outcome.ok {
            log::error!(
                "final transcription failed for session {}: {}",
                session.session_id,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
            return (String::new(), self.settings.force_language.clone());
        }
        (outcome.text, outcome.language)
    }

    fn progressive_mode(&self) -> bool {
        self.settings.live_transcription && !self.settings.live_batch_only
    }

    /// Whether a session is currently open (diagnostics).
    pub fn is_open(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }
}

fn chunk_extension(content_type: Option<&str>) -> &'static str {
    let base = content_type
        .unwrap_or("audio/webm")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match base.as_str() {
        "audio/ogg" | "application/ogg" => "ogg",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/mp4" => "mp4",
        _ => "webm",
    }
}

/// Tail of `full_text` after the chunk-0 baseline. When the baseline is not
/// a clean prefix (re-tokenization across the header boundary), fall back to
/// the full text.
fn strip_baseline(full_text: &str, baseline: Option<&str>) -> String {
    match baseline {
        Some(base) if !base.is_empty() && full_text.starts_with(base) => {
            full_text[base.len()..].trim().to_string()
        }
        _ => full_text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::temp_database;

    fn settings(dir: &std::path::Path, batch_only: bool) -> Arc<Settings> {
        Arc::new(Settings {
            data_dir: dir.to_path_buf(),
            desktop_mode: false,
            bundled_models_dir: None,
            live_transcription: true,
            live_mic: true,
            live_batch_only: batch_only,
            live_chunk_sec: 3600.0,
            live_stride_sec: 60.0,
            force_language: Some("en".into()),
            max_upload_bytes: 10 * 1024 * 1024,
            host: "127.0.0.1".into(),
            port: 8000,
        })
    }

    async fn manager(dir: &std::path::Path, batch_only: bool) -> (tempfile::TempDir, LiveSessionManager) {
        let settings = settings(dir, batch_only);
        let whisper = Arc::new(WhisperClient::new(&settings));
        let (db_dir, db) = temp_database().await;
        let mgr = LiveSessionManager::new(
            settings,
            Arc::new(AudioProcessor::new()),
            whisper,
            Arc::new(EventBus::new()),
            Arc::new(NlpProcessor::new()),
            db,
        );
        (db_dir, mgr)
    }

    #[test]
    fn baseline_prefix_is_stripped() {
        assert_eq!(
            strip_baseline("hello world and more", Some("hello world")),
            "and more"
        );
        // Not a clean prefix: emit the full text.
        assert_eq!(
            strip_baseline("hullo world and more", Some("hello world")),
            "hullo world and more"
        );
        assert_eq!(strip_baseline("anything", None), "anything");
        assert_eq!(strip_baseline("anything", Some("")), "anything");
    }

    #[test]
    fn content_type_maps_to_extension() {
        assert_eq!(chunk_extension(Some("audio/webm;codecs=opus")), "webm");
        assert_eq!(chunk_extension(Some("audio/ogg")), "ogg");
        assert_eq!(chunk_extension(Some("audio/wav")), "wav");
        assert_eq!(chunk_extension(None), "webm");
    }

    #[tokio::test]
    async fn push_to_unknown_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, mgr) = manager(dir.path(), true).await;
        let err = mgr
            .push("missing", Bytes::from_static(b"xx"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn chunk_indices_are_stable_and_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, mgr) = manager(dir.path(), true).await;
        let session_id = mgr.start().await.unwrap();

        for i in 0..3u64 {
            let outcome = mgr
                .push(&session_id, Bytes::from_static(b"chunk-bytes"), Some("audio/webm"))
                .await
                .unwrap();
            assert_eq!(outcome.chunk_index, i);
        }
        assert!(mgr.is_open(&session_id));
    }

    #[tokio::test]
    async fn stop_without_chunks_returns_no_call() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, mgr) = manager(dir.path(), true).await;
        let session_id = mgr.start().await.unwrap();

        let outcome = mgr.stop(&session_id).await.unwrap();
        assert!(outcome.call_id.is_none());
        assert!(outcome.final_text.is_empty());
        assert!(!mgr.is_open(&session_id));

        // Stopping twice is a 404.
        let err = mgr.stop(&session_id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn stop_persists_call_even_when_transcription_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, mgr) = manager(dir.path(), true).await;
        let session_id = mgr.start().await.unwrap();
        mgr.push(&session_id, Bytes::from_static(b"header"), None)
            .await
            .unwrap();
        mgr.push(&session_id, Bytes::from_static(b"cluster"), None)
            .await
            .unwrap();

        let outcome = mgr.stop(&session_id).await.unwrap();
        assert_eq!(outcome.call_id.as_deref(), Some(session_id.as_str()));

        let call = CallsRepository::get(mgr.db.pool(), &session_id)
            .await
            .unwrap()
            .expect("call row persisted");
        assert_eq!(call.status, "completed");
        assert!(call.file_path.is_some());

        let transcript = TranscriptsRepository::get_by_call(mgr.db.pool(), &session_id)
            .await
            .unwrap();
        assert!(transcript.is_some());

        // Session working dir is gone; the container lives under uploads/.
        assert!(!mgr.settings.live_sessions_dir().join(&session_id).exists());
        assert!(std::path::Path::new(call.file_path.as_deref().unwrap()).exists());
    }
}
