// Windowed transcription driver for long audio.
//
// Cuts the input into overlapping windows, drives the whisper client per
// window and emits partial results onto a channel as they land. The caller
// owns the receiving end (usually forwarding onto the SSE event bus).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audio::AudioProcessor;
use crate::whisper::{TranscribeOptions, WhisperClient};

/// Minimum forward progress per window, seconds. Guards against
/// `stride_sec >= chunk_sec` configurations looping forever.
const MIN_ADVANCE_SEC: f64 = 0.1;

/// Windows are transcribed independently; a low no-speech threshold keeps
/// quiet window edges from being dropped wholesale.
const WINDOW_NO_SPEECH_THRESHOLD: f64 = 0.3;

/// An extracted WAV at or below this size holds no samples worth sending.
const EMPTY_WINDOW_BYTES: u64 = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct ChunkPartial {
    pub chunk_index: u64,
    pub start_sec: f64,
    pub end_sec: f64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkSummary {
    pub audio_path: String,
    pub ok: bool,
    pub text: String,
    pub language: String,
    pub chunk_count: u64,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct ChunkedTranscriber {
    client: Arc<WhisperClient>,
    audio: Arc<AudioProcessor>,
}

impl ChunkedTranscriber {
    pub fn new(client: Arc<WhisperClient>, audio: Arc<AudioProcessor>) -> Self {
        Self { client, audio }
    }

    /// Transcribe `audio_path` window by window, sending a partial per window.
    ///
    /// Window extraction failures skip the window; the driver only reports
    /// failure when no window transcribed at all. Extracted WAV files are
    /// removed on every exit path.
    pub async fn transcribe_in_chunks(
        &self,
        audio_path: &Path,
        chunk_sec: f64,
        stride_sec: f64,
        language: Option<String>,
        tx: mpsc::UnboundedSender<ChunkPartial>,
    ) -> ChunkSummary {
        let work_dir = std::env::temp_dir().join(format!("transcriptai-chunks-{}", Uuid::new_v4()));
        let summary = self
            .run(audio_path, chunk_sec, stride_sec, language, &tx, &work_dir)
            .await;
        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to clean window dir {}: {e}", work_dir.display());
            }
        }
        summary
    }

    async fn run(
        &self,
        audio_path: &Path,
        chunk_sec: f64,
        stride_sec: f64,
        language: Option<String>,
        tx: &mpsc::UnboundedSender<ChunkPartial>,
        work_dir: &Path,
    ) -> ChunkSummary {
        // Unknown duration is tolerated; the loop then runs until extraction
        // stops yielding audio.
        let total_duration = match self.audio.analyze(audio_path).await {
            Ok(analysis) if analysis.duration_seconds > 0.0 => Some(analysis.duration_seconds),
            Ok(_) => None,
            Err(e) => {
                log::warn!("duration probe failed for {}: {e}", audio_path.display());
                None
            }
        };

        let advance = advance_step(chunk_sec, stride_sec);
        let forced_language = language;
        let mut detected_language: Option<String> = None;

        let mut parts: Vec<String> = Vec::new();
        let mut chunk_index: u64 = 0;
        let mut successful_windows: u64 = 0;
        let mut last_error: Option<String> = None;
        let mut start = 0.0_f64;

        loop {
            if let Some(total) = total_duration {
                if start >= total {
                    break;
                }
            }

            let window_path = work_dir.join(format!("window_{chunk_index:05}.wav"));
            if let Err(e) = self
                .audio
                .extract_window(audio_path, start, chunk_sec, &window_path)
                .await
            {
                log::warn!("skipping window {chunk_index} at {start:.1}s: {e}");
                if total_duration.is_none() {
                    break;
                }
                start += advance;
                chunk_index += 1;
                continue;
            }

            // With no known duration, an effectively empty extraction marks
            // the end of input.
            if total_duration.is_none() {
                let size = tokio::fs::metadata(&window_path)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                if size <= EMPTY_WINDOW_BYTES {
                    let _ = tokio::fs::remove_file(&window_path).await;
                    break;
                }
            }

            let opts = TranscribeOptions {
                language: forced_language
                    .clone()
                    .or_else(|| detected_language.clone()),
                no_speech_threshold: Some(WINDOW_NO_SPEECH_THRESHOLD),
                ..Default::default()
            };
            let outcome = self.client.transcribe(&window_path, &opts).await;
            let _ = tokio::fs::remove_file(&window_path).await;

            if outcome.ok {
                successful_windows += 1;
                let text = outcome.text.trim().to_string();

                if forced_language.is_none() && detected_language.is_none() && !text.is_empty() {
                    detected_language = outcome.language.clone();
                }

                let end_sec = match total_duration {
                    Some(total) => (start + chunk_sec).min(total),
                    None => start + chunk_sec,
                };
                let partial = ChunkPartial {
                    chunk_index,
                    start_sec: start,
                    end_sec,
                    text: text.clone(),
                };
                if tx.send(partial).is_err() {
                    log::debug!("partial receiver dropped for {}", audio_path.display());
                }

                if !text.is_empty() {
                    parts.push(text);
                }
            } else {
                last_error = outcome.error.clone();
                log::warn!(
                    "window {chunk_index} transcription failed for {}: {}",
                    audio_path.display(),
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
            }

            chunk_index += 1;
            start += advance;

            if total_duration.is_none() && !outcome.ok {
                // Without a duration there is no way to tell transient
                // failure from end of stream; stop rather than spin.
                break;
            }
        }

        let ok = successful_windows > 0;
        ChunkSummary {
            audio_path: audio_path.display().to_string(),
            ok,
            text: parts.join(" "),
            language: forced_language
                .or(detected_language)
                .unwrap_or_else(|| "unknown".to_string()),
            chunk_count: chunk_index,
            timestamp: Utc::now().to_rfc3339(),
            error: if ok { None } else { last_error },
        }
    }
}

/// Start-offset increment between windows, clamped so every iteration moves
/// forward.
fn advance_step(chunk_sec: f64, stride_sec: f64) -> f64 {
    (chunk_sec - stride_sec).max(MIN_ADVANCE_SEC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_clamps_when_stride_exceeds_chunk() {
        assert_eq!(advance_step(10.0, 60.0), MIN_ADVANCE_SEC);
        assert_eq!(advance_step(10.0, 10.0), MIN_ADVANCE_SEC);
    }

    #[test]
    fn advance_is_chunk_minus_stride() {
        assert_eq!(advance_step(3600.0, 60.0), 3540.0);
    }

    #[test]
    fn window_count_covers_full_duration() {
        // 10s of audio with 4s windows advancing 3s: starts at 0,3,6,9.
        let advance = advance_step(4.0, 1.0);
        let mut starts = Vec::new();
        let mut start = 0.0;
        while start < 10.0 {
            starts.push(start);
            start += advance;
        }
        assert_eq!(starts.len(), 4);
    }
}
