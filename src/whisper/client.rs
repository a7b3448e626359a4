// HTTP client for the local whisper.cpp server.
//
// The server is a separate process on loopback; this client covers one-shot
// transcription (multipart POST /inference), hot model swap (POST /load) and
// the health probe (GET /). Transcription failures come back as structured
// outcomes so pipeline stages can decide what is retryable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::Settings;
use crate::whisper::dedup;

const DEFAULT_PORT: &str = "8002";
const INFERENCE_TIMEOUT: Duration = Duration::from_secs(300);
const LOAD_TIMEOUT: Duration = Duration::from_secs(120);
const HEALTH_TIMEOUT: Duration = Duration::from_millis(1000);

/// Share of dropped characters above which dedup logs a warning.
const DEDUP_WARN_RATIO: f64 = 0.10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptionSegment {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_logprob: Option<f64>,
}

/// Average per-segment confidence on a 0..1 scale, derived from log
/// probabilities when the server reports them.
pub fn confidence_score(segments: &[TranscriptionSegment]) -> f64 {
    let mut total = 0.0;
    let mut counted = 0usize;
    for segment in segments {
        if let Some(logprob) = segment.avg_logprob {
            total += ((logprob + 1.0) / 2.0).clamp(0.0, 1.0);
            counted += 1;
        }
    }
    if counted == 0 {
        0.0
    } else {
        total / counted as f64
    }
}

/// Raw response body from whisper.cpp `/inference`.
#[derive(Debug, Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    segments: Vec<TranscriptionSegment>,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionOutcome {
    pub audio_path: String,
    pub ok: bool,
    pub text: String,
    pub segments: Vec<TranscriptionSegment>,
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TranscriptionOutcome {
    fn failure(audio_path: &Path, error: String) -> Self {
        Self {
            audio_path: audio_path.display().to_string(),
            ok: false,
            text: String::new(),
            segments: Vec::new(),
            language: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TranscribeOptions {
    pub language: Option<String>,
    pub initial_prompt: Option<String>,
    /// Overridden to 0.3 by the chunked driver; 0.6 otherwise.
    pub no_speech_threshold: Option<f64>,
    pub translate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ready,
    Offline,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub backend: &'static str,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub struct WhisperClient {
    http: reqwest::Client,
    base_url: String,
    /// Name of the model the server currently has loaded, best-effort hint.
    model_name: RwLock<String>,
}

impl WhisperClient {
    pub fn new(settings: &Settings) -> Self {
        let port = discover_port(settings);
        let base_url = format!("http://127.0.0.1:{port}");
        log::info!("whisper client pointing at {base_url}");
        Self {
            http: reqwest::Client::new(),
            base_url,
            model_name: RwLock::new("base".to_string()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn model_name(&self) -> String {
        self.model_name.read().await.clone()
    }

    /// One-shot transcription with anti-hallucination tuning.
    ///
    /// Never returns `Err` for server/network trouble; callers get a
    /// structured failure instead.
    pub async fn transcribe(&self, audio_path: &Path, opts: &TranscribeOptions) -> TranscriptionOutcome {
        let bytes = match tokio::fs::read(audio_path).await {
            Ok(b) => b,
            Err(e) => {
                return TranscriptionOutcome::failure(
                    audio_path,
                    format!("audio file not readable: {e}"),
                )
            }
        };

        let file_name = audio_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.wav".to_string());

        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes)
                    .file_name(file_name)
                    .mime_str("audio/wav")
                    .expect("static mime type"),
            )
            .text("response_format", "json")
            .text("temperature", "0.0")
            .text("entropy_threshold", "2.8")
            .text("logprob_threshold", "-1.0")
            .text(
                "no_speech_threshold",
                format!("{}", opts.no_speech_threshold.unwrap_or(0.6)),
            )
            .text("suppress_blank", "true")
            .text("suppress_non_speech_tokens", "true")
            .text("max_context", "64")
            .text("beam_size", "5")
            .text("condition_on_previous_text", "false");

        if opts.translate {
            form = form.text("task", "translate");
        }
        if let Some(language) = &opts.language {
            form = form.text("language", language.clone());
        }
        if let Some(prompt) = &opts.initial_prompt {
            form = form.text("prompt", prompt.clone());
        }

        let url = format!("{}/inference", self.base_url);
        let started = std::time::Instant::now();

        let response = match self
            .http
            .post(&url)
            .multipart(form)
            .timeout(INFERENCE_TIMEOUT)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                log::error!("whisper server timeout at {url}");
                return TranscriptionOutcome::failure(
                    audio_path,
                    format!("whisper server timeout at {url}"),
                );
            }
            Err(e) if e.is_connect() => {
                log::error!(
                    "connection failed to whisper server at {url}; is whisper-server running?"
                );
                return TranscriptionOutcome::failure(
                    audio_path,
                    format!("connection failed to whisper server at {url}"),
                );
            }
            Err(e) => {
                return TranscriptionOutcome::failure(audio_path, format!("transcription failed: {e}"))
            }
        };

        if !response.status().is_success() {
            return TranscriptionOutcome::failure(
                audio_path,
                format!("whisper server returned HTTP {}", response.status()),
            );
        }

        let body: InferenceResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                return TranscriptionOutcome::failure(
                    audio_path,
                    format!("unparseable whisper response: {e}"),
                )
            }
        };

        log::info!(
            "transcription complete in {:.2}s ({} segments)",
            started.elapsed().as_secs_f64(),
            body.segments.len()
        );

        let original_text = body.text.trim().to_string();
        let (text, segments, removed) =
            dedup::dedupe_transcription(&original_text, body.segments);
        let original_chars = original_text.chars().count();
        if original_chars > 0 && removed as f64 / original_chars as f64 > DEDUP_WARN_RATIO {
            log::warn!(
                "dedup removed {removed} of {original_chars} chars from {} output",
                audio_path.display()
            );
        }

        TranscriptionOutcome {
            audio_path: audio_path.display().to_string(),
            ok: true,
            text,
            segments,
            language: body.language,
            error: None,
        }
    }

    /// Hot-swap the server's model via `/load`.
    pub async fn load_model(&self, model_path: &Path) -> Result<()> {
        let url = format!("{}/load", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "model": model_path.display().to_string() }))
            .timeout(LOAD_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("load request to {url} failed"))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "model load rejected with HTTP {}",
                response.status()
            ));
        }

        if let Some(stem) = model_path.file_stem().map(|s| s.to_string_lossy().into_owned()) {
            *self.model_name.write().await = stem;
        }
        Ok(())
    }

    /// Fast probe: 2xx on `/` means the server is up and serving.
    pub async fn health(&self) -> HealthSnapshot {
        let url = format!("{}/", self.base_url);
        match self.http.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => HealthSnapshot {
                status: HealthStatus::Ready,
                backend: "whisper.cpp",
                url: self.base_url.clone(),
                detail: None,
            },
            Ok(resp) => HealthSnapshot {
                status: HealthStatus::Error,
                backend: "whisper.cpp",
                url: self.base_url.clone(),
                detail: Some(format!("HTTP {}", resp.status())),
            },
            Err(e) => HealthSnapshot {
                status: HealthStatus::Offline,
                backend: "whisper.cpp",
                url: self.base_url.clone(),
                detail: Some(e.to_string()),
            },
        }
    }

    /// Poll the health probe until the server is ready.
    pub async fn ensure_ready(&self, attempts: u32, delay: Duration) -> bool {
        for attempt in 0..attempts {
            if self.health().await.status == HealthStatus::Ready {
                return true;
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        false
    }
}

/// Port discovery, ordered: env var, sentinel file under the data dir, fixed
/// default.
fn discover_port(settings: &Settings) -> String {
    if let Ok(port) = std::env::var("WHISPER_CPP_PORT") {
        let port = port.trim().to_string();
        if !port.is_empty() {
            log::info!("whisper port from WHISPER_CPP_PORT: {port}");
            return port;
        }
    }

    let port_file: PathBuf = settings.whisper_port_file();
    match std::fs::read_to_string(&port_file) {
        Ok(contents) => {
            let port = contents.trim();
            if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) {
                log::info!("whisper port from {}: {port}", port_file.display());
                return port.to_string();
            }
            log::warn!(
                "port file {} contains invalid data: '{port}'",
                port_file.display()
            );
        }
        Err(_) => {}
    }

    log::warn!("using fallback whisper port {DEFAULT_PORT}");
    DEFAULT_PORT.to_string()
}
