// Environment-driven configuration.
//
// Desktop mode keeps everything under a single data directory so the app can
// run without any external services besides the co-located whisper server.

use std::env;
use std::path::PathBuf;

/// Audio file extensions accepted by the upload surface.
pub const ALLOWED_AUDIO_EXTENSIONS: &[&str] = &[".wav", ".mp3", ".m4a", ".flac", ".ogg", ".aac"];

/// Upload streaming block size (8 MiB). Large files never sit in memory whole.
pub const UPLOAD_CHUNK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Base directory for DB, uploads, models, logs and job state.
    pub data_dir: PathBuf,
    /// `desktop` enables the single-user layout and forces English.
    pub desktop_mode: bool,
    /// Optional read-only directory with bundled models.
    pub bundled_models_dir: Option<PathBuf>,
    /// SSE progressive transcription (default on).
    pub live_transcription: bool,
    /// Live microphone endpoints (default on).
    pub live_mic: bool,
    /// Accumulate live chunks and transcribe once on stop.
    pub live_batch_only: bool,
    /// Window length for chunked transcription, seconds.
    pub live_chunk_sec: f64,
    /// Window overlap for chunked transcription, seconds.
    pub live_stride_sec: f64,
    /// Force a transcription language instead of auto-detecting.
    pub force_language: Option<String>,
    /// Upload size cap in bytes.
    pub max_upload_bytes: u64,
    pub host: String,
    pub port: u16,
}

impl Settings {
    pub fn from_env() -> Self {
        let desktop_mode = env::var("TRANSCRIPTAI_MODE")
            .map(|v| v.eq_ignore_ascii_case("desktop"))
            .unwrap_or(false);

        let data_dir = env::var("TRANSCRIPTAI_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .map(|d| d.join("transcriptai"))
                    .unwrap_or_else(|| PathBuf::from("./data"))
            });

        let force_language = env::var("TRANSCRIPTAI_FORCE_LANGUAGE")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| {
                // Desktop installs are English-only by policy.
                if desktop_mode {
                    Some("en".to_string())
                } else {
                    None
                }
            });

        Self {
            data_dir,
            desktop_mode,
            bundled_models_dir: env::var("TRANSCRIPTAI_BUNDLED_MODELS_DIR")
                .ok()
                .map(PathBuf::from),
            live_transcription: env_flag("TRANSCRIPTAI_LIVE_TRANSCRIPTION", true),
            live_mic: env_flag("TRANSCRIPTAI_LIVE_MIC", true),
            live_batch_only: env_flag("TRANSCRIPTAI_LIVE_BATCH_ONLY", false),
            live_chunk_sec: env_f64("TRANSCRIPTAI_LIVE_CHUNK_SEC", 3600.0),
            live_stride_sec: env_f64("TRANSCRIPTAI_LIVE_STRIDE_SEC", 60.0),
            force_language,
            max_upload_bytes: env_f64("TRANSCRIPTAI_MAX_UPLOAD_MB", 500.0) as u64 * 1024 * 1024,
            host: env::var("TRANSCRIPTAI_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("TRANSCRIPTAI_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("db.sqlite")
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.upload_dir().join("processed")
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.upload_dir().join("transcripts")
    }

    /// Working directories for in-flight live sessions.
    pub fn live_sessions_dir(&self) -> PathBuf {
        self.data_dir.join("live")
    }

    /// User-writable models directory (downloads land here).
    pub fn user_models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    pub fn model_preference_path(&self) -> PathBuf {
        self.data_dir.join("model_preference.json")
    }

    pub fn model_jobs_path(&self) -> PathBuf {
        self.data_dir.join("model_jobs.json")
    }

    /// Sentinel file the launcher writes with the whisper-server port.
    pub fn whisper_port_file(&self) -> PathBuf {
        self.data_dir.join("transcriptai_whisper_port")
    }

    /// Resolve a model file on disk, preferring the bundled directory.
    pub fn model_path(&self, file_name: &str) -> Option<PathBuf> {
        if let Some(bundled) = &self.bundled_models_dir {
            let candidate = bundled.join(file_name);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        let candidate = self.user_models_dir().join(file_name);
        candidate.exists().then_some(candidate)
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => {
            let v = v.trim().to_ascii_lowercase();
            !matches!(v.as_str(), "0" | "false" | "off" | "no")
        }
        Err(_) => default,
    }
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
