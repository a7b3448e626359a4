// Short-form dictation: decode a base64 audio snippet, normalize it to
// 16 kHz mono WAV and run a single transcription. Used by push-to-talk style
// clients that do not want a full call record.

use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::audio::AudioProcessor;
use crate::config::Settings;
use crate::error::{AppError, AppResult};
use crate::whisper::{confidence_score, TranscribeOptions, WhisperClient};

/// Snippets are bounded hard: they are meant for dictation, not uploads.
const MAX_SNIPPET_BYTES: usize = 5 * 1024 * 1024;
const MAX_SNIPPET_DURATION_MS: u64 = 120 * 1000;

const ALLOWED_MEDIA_TYPES: &[(&str, &str)] = &[
    ("audio/wav", "wav"),
    ("audio/x-wav", "wav"),
    ("audio/mpeg", "mp3"),
    ("audio/mp3", "mp3"),
    ("audio/ogg", "ogg"),
    ("audio/webm", "webm"),
];

#[derive(Debug, Clone, Serialize)]
pub struct DictationResult {
    pub text: String,
    /// 0..1 scale.
    pub confidence: f64,
    pub duration_ms: u64,
}

pub struct DictationService {
    settings: Arc<Settings>,
    audio: Arc<AudioProcessor>,
    whisper: Arc<WhisperClient>,
}

impl DictationService {
    pub fn new(
        settings: Arc<Settings>,
        audio: Arc<AudioProcessor>,
        whisper: Arc<WhisperClient>,
    ) -> Self {
        Self {
            settings,
            audio,
            whisper,
        }
    }

    /// Decode, normalize and transcribe one snippet.
    pub async fn transcribe_snippet(
        &self,
        audio_base64: &str,
        media_type: Option<&str>,
    ) -> AppResult<DictationResult> {
        let extension = snippet_extension(media_type)?;

        if audio_base64.trim().is_empty() {
            return Err(AppError::Validation("audio_base64 payload is required".into()));
        }
        let audio_bytes = BASE64
            .decode(audio_base64.trim())
            .map_err(|_| AppError::Validation("audio_base64 payload is not valid base64".into()))?;
        if audio_bytes.is_empty() {
            return Err(AppError::Validation("audio_base64 payload is empty".into()));
        }
        if audio_bytes.len() > MAX_SNIPPET_BYTES {
            return Err(AppError::Validation(
                "audio payload exceeds maximum allowed size".into(),
            ));
        }

        let scratch = std::env::temp_dir().join(format!("transcriptai-dictation-{}", Uuid::new_v4()));
        let result = self
            .transcribe_in_scratch(&scratch, extension, &audio_bytes)
            .await;
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to clean dictation scratch {}: {e}", scratch.display());
            }
        }
        result
    }

    async fn transcribe_in_scratch(
        &self,
        scratch: &std::path::Path,
        extension: &str,
        audio_bytes: &[u8],
    ) -> AppResult<DictationResult> {
        tokio::fs::create_dir_all(scratch).await?;
        let input: PathBuf = scratch.join(format!("snippet.{extension}"));
        tokio::fs::write(&input, audio_bytes).await?;

        let wav = scratch.join("snippet.wav");
        self.audio
            .convert_to_wav(&input, &wav)
            .await
            .map_err(|e| AppError::Validation(format!("unable to normalize audio snippet: {e}")))?;

        let analysis = self
            .audio
            .analyze(&wav)
            .await
            .map_err(|e| AppError::Validation(format!("unable to analyze audio snippet: {e}")))?;
        let duration_ms = (analysis.duration_seconds * 1000.0) as u64;
        if duration_ms > MAX_SNIPPET_DURATION_MS {
            return Err(AppError::Validation(
                "audio snippet duration exceeds limit".into(),
            ));
        }

        let opts = TranscribeOptions {
            language: self.settings.force_language.clone(),
            ..Default::default()
        };
        let outcome = self.whisper.transcribe(&wav, &opts).await;
        if !outcome.ok {
            return Err(AppError::Unavailable(
                outcome
                    .error
                    .unwrap_or_else(|| "transcription failed".into()),
            ));
        }

        Ok(DictationResult {
            text: outcome.text,
            confidence: confidence_score(&outcome.segments),
            duration_ms,
        })
    }

    /// Readiness for the warmup endpoint.
    pub async fn is_ready(&self) -> bool {
        self.whisper.health().await.status == crate::whisper::HealthStatus::Ready
    }
}

/// Strip codec suffixes ("audio/webm;codecs=opus") and map to an extension.
fn snippet_extension(media_type: Option<&str>) -> AppResult<&'static str> {
    let base = media_type
        .unwrap_or("audio/wav")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    ALLOWED_MEDIA_TYPES
        .iter()
        .find(|(mime, _)| *mime == base)
        .map(|(_, ext)| *ext)
        .ok_or_else(|| AppError::Validation("Unsupported media_type".into()))
}
