// End-to-end processing of one stored audio file.
//
// Stages run strictly in sequence — upload, audio_processing, transcription,
// nlp_analysis, database_storage — each timed, each with its own retry
// budget. Any stage failure marks the call failed, records the failed step
// with the monitor and propagates.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use chrono::Utc;
use futures_util::Stream;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audio::{AudioAnalysis, AudioProcessor};
use crate::config::Settings;
use crate::db::models::{CallStatus, NewCall};
use crate::db::repositories::{AnalysesRepository, CallsRepository, TranscriptsRepository};
use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::live::{EventBus, LiveEvent};
use crate::nlp::{AnalysisOutcome, NlpProcessor};
use crate::pipeline::PipelineMonitor;
use crate::upload::{SavedUpload, UploadHandler};
use crate::whisper::{
    confidence_score, ChunkPartial, ChunkedTranscriber, TranscribeOptions, WhisperClient,
};

const STAGE_UPLOAD: &str = "upload";
const STAGE_AUDIO: &str = "audio_processing";
const STAGE_TRANSCRIPTION: &str = "transcription";
const STAGE_NLP: &str = "nlp_analysis";
const STAGE_STORAGE: &str = "database_storage";

#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: String,
    pub status: String,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StageTimings {
    pub stages: Vec<StageTiming>,
}

impl StageTimings {
    fn record(&mut self, stage: &str, status: &str, duration: f64, error: Option<String>) {
        self.stages.push(StageTiming {
            stage: stage.to_string(),
            status: status.to_string(),
            duration_seconds: duration,
            error,
        });
    }

    pub fn total_seconds(&self) -> f64 {
        self.stages.iter().map(|s| s.duration_seconds).sum()
    }
}

#[derive(Debug, Serialize)]
pub struct PipelineOutcome {
    pub call_id: String,
    pub status: &'static str,
    pub transcript_text: String,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisOutcome>,
    pub timings: StageTimings,
    pub timestamp: String,
}

/// Everything the later stages need, threaded through instead of shared
/// mutable pipeline state.
struct StageData {
    saved: SavedUpload,
    analysis: Option<AudioAnalysis>,
    transcript_text: String,
    language: String,
    confidence: i64,
    nlp: Option<AnalysisOutcome>,
}

pub struct PipelineOrchestrator {
    settings: Arc<Settings>,
    uploads: UploadHandler,
    audio: Arc<AudioProcessor>,
    whisper: Arc<WhisperClient>,
    nlp: Arc<NlpProcessor>,
    db: Database,
    monitor: Arc<PipelineMonitor>,
    bus: Arc<EventBus>,
}

impl PipelineOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        audio: Arc<AudioProcessor>,
        whisper: Arc<WhisperClient>,
        nlp: Arc<NlpProcessor>,
        db: Database,
        monitor: Arc<PipelineMonitor>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            uploads: UploadHandler::new(settings.clone()),
            settings,
            audio,
            whisper,
            nlp,
            db,
            monitor,
            bus,
        }
    }

    /// Full pipeline over an incoming upload stream.
    pub async fn process_upload<S, E>(&self, filename: &str, stream: S) -> AppResult<PipelineOutcome>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let call_id = Uuid::new_v4().to_string();
        log::info!("pipeline started for call {call_id} ({filename})");
        self.monitor
            .start_pipeline(&call_id, json!({ "filename": filename }));

        let mut timings = StageTimings::default();
        match self.run_stages(&call_id, filename, stream, &mut timings).await {
            Ok(data) => {
                self.monitor.complete_pipeline(&call_id);
                log::info!("pipeline completed for call {call_id}");
                Ok(PipelineOutcome {
                    call_id,
                    status: "completed",
                    transcript_text: data.transcript_text,
                    language: data.language,
                    analysis: data.nlp,
                    timings,
                    timestamp: Utc::now().to_rfc3339(),
                })
            }
            Err((stage, err)) => {
                if let Err(db_err) = CallsRepository::update_status(
                    self.db.pool(),
                    &call_id,
                    CallStatus::Failed,
                    Some(&err.to_string()),
                )
                .await
                {
                    log::error!("failed to record failure for {call_id}: {db_err}");
                }
                self.monitor
                    .fail_pipeline(&call_id, &err.to_string(), Some(&stage));
                Err(err)
            }
        }
    }

    async fn run_stages<S, E>(
        &self,
        call_id: &str,
        filename: &str,
        stream: S,
        timings: &mut StageTimings,
    ) -> Result<StageData, (String, AppError)>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let mut data = self
            .stage(call_id, STAGE_UPLOAD, timings, self.step_upload(call_id, filename, stream))
            .await?;

        data.analysis = Some(
            self.stage(
                call_id,
                STAGE_AUDIO,
                timings,
                self.step_audio_processing(call_id, &data.saved),
            )
            .await?,
        );

        let (text, language, confidence) = self
            .stage(
                call_id,
                STAGE_TRANSCRIPTION,
                timings,
                self.step_transcription(call_id, &data.saved),
            )
            .await?;
        data.transcript_text = text;
        data.language = language;
        data.confidence = confidence;

        data.nlp = self
            .stage(
                call_id,
                STAGE_NLP,
                timings,
                self.step_nlp(call_id, &data.transcript_text),
            )
            .await?;

        self.stage(call_id, STAGE_STORAGE, timings, self.step_storage(call_id, &data))
            .await?;

        Ok(data)
    }

    /// Run one stage with timing, tracker and monitor bookkeeping.
    async fn stage<T>(
        &self,
        call_id: &str,
        name: &str,
        timings: &mut StageTimings,
        fut: impl std::future::Future<Output = AppResult<T>>,
    ) -> Result<T, (String, AppError)> {
        log::info!("pipeline step started: {call_id} -> {name}");
        let started = std::time::Instant::now();
        let result = fut.await;
        let duration = started.elapsed().as_secs_f64();

        match result {
            Ok(value) => {
                timings.record(name, "completed", duration, None);
                self.monitor
                    .update_step(call_id, name, "completed", Some(duration), None);
                log::info!("pipeline step completed: {call_id} -> {name} ({duration:.2}s)");
                Ok(value)
            }
            Err(err) => {
                timings.record(name, "failed", duration, Some(err.to_string()));
                self.monitor.update_step(
                    call_id,
                    name,
                    "failed",
                    Some(duration),
                    Some(&err.to_string()),
                );
                log::error!("pipeline step failed: {call_id} -> {name}: {err}");
                Err((name.to_string(), err))
            }
        }
    }

    async fn step_upload<S, E>(
        &self,
        call_id: &str,
        filename: &str,
        stream: S,
    ) -> AppResult<StageData>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let saved = self.uploads.save_stream(call_id, filename, stream).await?;

        // Duration is best-effort here; the processing stage measures it
        // authoritatively.
        let duration = self
            .audio
            .analyze(&saved.file_path)
            .await
            .ok()
            .map(|a| a.duration_seconds);

        CallsRepository::create(
            self.db.pool(),
            &NewCall {
                call_id: call_id.to_string(),
                file_path: saved.file_path.display().to_string(),
                original_filename: saved.original_filename.clone(),
                file_size_bytes: saved.size_bytes as i64,
                duration,
            },
        )
        .await?;

        Ok(StageData {
            saved,
            analysis: None,
            transcript_text: String::new(),
            language: "unknown".to_string(),
            confidence: 0,
            nlp: None,
        })
    }

    async fn step_audio_processing(
        &self,
        call_id: &str,
        saved: &SavedUpload,
    ) -> AppResult<AudioAnalysis> {
        CallsRepository::update_status(self.db.pool(), call_id, CallStatus::Processing, None)
            .await?;

        let path = saved.file_path.clone();
        let audio = self.audio.clone();
        let analysis = retry_operation("audio_analysis", 3, || {
            let audio = audio.clone();
            let path = path.clone();
            async move { audio.analyze(&path).await }
        })
        .await
        .map_err(|e| AppError::Transient(format!("audio analysis failed: {e}")))?;

        Ok(analysis)
    }

    async fn step_transcription(
        &self,
        call_id: &str,
        saved: &SavedUpload,
    ) -> AppResult<(String, String, i64)> {
        CallsRepository::update_status(self.db.pool(), call_id, CallStatus::Transcribing, None)
            .await?;

        let progressive = self.settings.live_transcription && !self.settings.live_batch_only;

        let (text, language, confidence) = if progressive {
            self.transcribe_chunked(call_id, saved).await?
        } else {
            self.transcribe_single_shot(call_id, saved).await?
        };

        self.save_transcript_snapshot(call_id, &text, &language).await;
        Ok((text, language, confidence))
    }

    /// Progressive path: windowed transcription, each partial published on
    /// the event bus keyed by call_id, `complete` after the last window.
    /// No retries — windows already skip transient failures individually.
    async fn transcribe_chunked(
        &self,
        call_id: &str,
        saved: &SavedUpload,
    ) -> AppResult<(String, String, i64)> {
        let transcriber = ChunkedTranscriber::new(self.whisper.clone(), self.audio.clone());
        let (tx, mut rx) = mpsc::unbounded_channel::<ChunkPartial>();

        let bus = self.bus.clone();
        let forward_id = call_id.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(partial) = rx.recv().await {
                bus.publish(
                    &forward_id,
                    LiveEvent::Partial {
                        call_id: forward_id.clone(),
                        chunk_index: partial.chunk_index,
                        text: partial.text,
                        start_sec: Some(partial.start_sec),
                        end_sec: Some(partial.end_sec),
                    },
                );
            }
        });

        let summary = transcriber
            .transcribe_in_chunks(
                &saved.file_path,
                self.settings.live_chunk_sec,
                self.settings.live_stride_sec,
                self.settings.force_language.clone(),
                tx,
            )
            .await;

        // The sender is dropped by now; wait for the forwarder to drain so
        // partials precede `complete`.
        let _ = forwarder.await;
        self.bus.complete(call_id);

        if !summary.ok {
            return Err(AppError::Transient(format!(
                "Transcription failed: {}",
                summary.error.unwrap_or_else(|| "no window transcribed".into())
            )));
        }
        Ok((summary.text, summary.language, 0))
    }

    /// Batch path: transcode to 16 kHz mono WAV, then one `/inference` call
    /// with up to two retries.
    async fn transcribe_single_shot(
        &self,
        call_id: &str,
        saved: &SavedUpload,
    ) -> AppResult<(String, String, i64)> {
        let processed = self
            .settings
            .processed_dir()
            .join(format!("{call_id}_converted.wav"));
        let wav_path = match self.audio.convert_to_wav(&saved.file_path, &processed).await {
            Ok(()) => processed,
            Err(e) => {
                log::warn!("conversion before transcription failed, using original: {e}");
                saved.file_path.clone()
            }
        };

        let whisper = self.whisper.clone();
        let opts = TranscribeOptions {
            language: self.settings.force_language.clone(),
            ..Default::default()
        };
        let outcome = retry_operation("transcription", 2, || {
            let whisper = whisper.clone();
            let opts = opts.clone();
            let wav_path = wav_path.clone();
            async move {
                let outcome = whisper.transcribe(&wav_path, &opts).await;
                if outcome.ok {
                    Ok(outcome)
                } else {
                    Err(anyhow!(outcome
                        .error
                        .unwrap_or_else(|| "transcription failed".into())))
                }
            }
        })
        .await
        .map_err(|e| AppError::Transient(format!("Transcription failed: {e}")))?;

        let confidence = (confidence_score(&outcome.segments) * 100.0).round() as i64;
        let language = outcome.language.unwrap_or_else(|| "unknown".to_string());
        Ok((outcome.text, language, confidence))
    }

    /// JSON snapshot under `uploads/transcripts/YYYY/MM/DD/`. Best effort;
    /// the database row is the source of truth.
    async fn save_transcript_snapshot(&self, call_id: &str, text: &str, language: &str) {
        let dated = Utc::now().format("%Y/%m/%d").to_string();
        let dir = self.settings.transcripts_dir().join(dated);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            log::warn!("could not create transcript dir: {e}");
            return;
        }
        let path = dir.join(format!("{call_id}_transcript.json"));
        let body = json!({
            "call_id": call_id,
            "text": text,
            "language": language,
            "created_at": Utc::now().to_rfc3339(),
        });
        if let Err(e) = tokio::fs::write(&path, body.to_string()).await {
            log::warn!("could not write transcript snapshot {}: {e}", path.display());
        }
    }

    async fn step_nlp(&self, call_id: &str, text: &str) -> AppResult<Option<AnalysisOutcome>> {
        if text.trim().is_empty() {
            log::warn!("no text available for NLP analysis in call {call_id}");
            return Ok(None);
        }
        Ok(Some(self.nlp.analyze(text)))
    }

    async fn step_storage(&self, call_id: &str, data: &StageData) -> AppResult<()> {
        let pool = self.db.pool().clone();

        let text = data.transcript_text.clone();
        let language = data.language.clone();
        let confidence = data.confidence;
        let store_id = call_id.to_string();
        retry_operation("transcript_storage", 3, || {
            let pool = pool.clone();
            let store_id = store_id.clone();
            let text = text.clone();
            let language = language.clone();
            async move {
                TranscriptsRepository::store(&pool, &store_id, &text, Some(&language), confidence)
                    .await
                    .map_err(|e| anyhow!(e))
            }
        })
        .await
        .map_err(|e| AppError::Transient(format!("transcript storage failed: {e}")))?;

        if let Some(analysis) = &data.analysis {
            let summary = analysis.clone();
            retry_operation("analysis_storage", 3, || {
                let pool = pool.clone();
                let store_id = store_id.clone();
                let summary = summary.clone();
                async move {
                    CallsRepository::update_audio_summary(
                        &pool,
                        &store_id,
                        Some(summary.duration_seconds),
                        Some(&summary.format),
                        Some(summary.sample_rate as i64),
                        Some(summary.channels as i64),
                    )
                    .await
                    .map_err(|e| anyhow!(e))
                }
            })
            .await
            .map_err(|e| AppError::Transient(format!("analysis storage failed: {e}")))?;
        }

        if let Some(nlp) = &data.nlp {
            let row = nlp.to_new_analysis();
            retry_operation("nlp_analysis_storage", 3, || {
                let pool = pool.clone();
                let store_id = store_id.clone();
                let row = row.clone();
                async move {
                    AnalysesRepository::insert(&pool, &store_id, &row)
                        .await
                        .map_err(|e| anyhow!(e))
                }
            })
            .await
            .map_err(|e| AppError::Transient(format!("nlp storage failed: {e}")))?;
        }

        CallsRepository::update_status(&pool, call_id, CallStatus::Completed, None).await?;
        Ok(())
    }

    /// Re-run only the NLP stage over the stored transcript.
    pub async fn reanalyze(&self, call_id: &str) -> AppResult<AnalysisOutcome> {
        let transcript = TranscriptsRepository::get_by_call(self.db.pool(), call_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("No transcript for call {call_id}")))?;

        let outcome = self.nlp.analyze(&transcript.text);
        AnalysesRepository::insert(self.db.pool(), call_id, &outcome.to_new_analysis()).await?;
        log::info!("re-analysis stored for call {call_id}");
        Ok(outcome)
    }
}

/// Retry with exponential backoff: waits 2^attempt seconds between tries and
/// re-raises the final error.
pub async fn retry_operation<T, F, Fut>(
    operation_name: &str,
    max_retries: u32,
    mut operation: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_retries => {
                let wait = Duration::from_secs(1 << attempt);
                log::warn!(
                    "{operation_name} failed (attempt {}), retrying in {}s: {err}",
                    attempt + 1,
                    wait.as_secs()
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(err) => {
                log::error!(
                    "{operation_name} failed after {} attempts: {err}",
                    attempt + 1
                );
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        tokio::time::pause();
        let attempts = AtomicU32::new(0);
        let fut = retry_operation("flaky", 3, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(anyhow!("transient"))
                } else {
                    Ok(n)
                }
            }
        });
        // Paused clock: sleeps resolve instantly once awaited.
        let value = fut.await.unwrap();
        assert_eq!(value, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_budget() {
        tokio::time::pause();
        let attempts = AtomicU32::new(0);
        let result: anyhow::Result<()> = retry_operation("doomed", 2, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow!("always")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    fn test_settings(dir: &std::path::Path) -> Arc<Settings> {
        Arc::new(Settings {
            data_dir: dir.to_path_buf(),
            desktop_mode: false,
            bundled_models_dir: None,
            live_transcription: true,
            live_mic: true,
            live_batch_only: false,
            live_chunk_sec: 3600.0,
            live_stride_sec: 60.0,
            force_language: Some("en".into()),
            max_upload_bytes: 1024 * 1024,
            host: "127.0.0.1".into(),
            port: 8000,
        })
    }

    async fn test_orchestrator(
        dir: &std::path::Path,
    ) -> (tempfile::TempDir, crate::db::Database, PipelineOrchestrator) {
        let settings = test_settings(dir);
        let whisper = Arc::new(WhisperClient::new(&settings));
        let (db_dir, db) = crate::db::testing::temp_database().await;
        let orchestrator = PipelineOrchestrator::new(
            settings,
            Arc::new(AudioProcessor::new()),
            whisper,
            Arc::new(crate::nlp::NlpProcessor::new()),
            db.clone(),
            Arc::new(PipelineMonitor::new()),
            Arc::new(EventBus::new()),
        );
        (db_dir, db, orchestrator)
    }

    #[tokio::test]
    async fn reanalyze_appends_analysis_for_stored_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let (_db_dir, db, orchestrator) = test_orchestrator(dir.path()).await;

        CallsRepository::create(
            db.pool(),
            &NewCall {
                call_id: "c1".into(),
                file_path: "/tmp/c1.wav".into(),
                original_filename: "c1.wav".into(),
                file_size_bytes: 10,
                duration: None,
            },
        )
        .await
        .unwrap();
        TranscriptsRepository::store(
            db.pool(),
            "c1",
            "I need help with a billing problem on my invoice",
            Some("en"),
            80,
        )
        .await
        .unwrap();

        let first = orchestrator.reanalyze("c1").await.unwrap();
        let second = orchestrator.reanalyze("c1").await.unwrap();
        assert_eq!(first.intent.intent, second.intent.intent);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM analyses WHERE call_id = 'c1'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn reanalyze_without_transcript_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (_db_dir, _db, orchestrator) = test_orchestrator(dir.path()).await;
        let err = orchestrator.reanalyze("missing").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn stage_timings_sum_to_total() {
        let mut timings = StageTimings::default();
        timings.record("upload", "completed", 1.0, None);
        timings.record("transcription", "completed", 2.5, None);
        assert!((timings.total_seconds() - 3.5).abs() < f64::EPSILON);
    }
}
