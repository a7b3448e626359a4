// Download manager and runtime model selection.
//
// The manager owns the global download cap (2 permits), per-model locks for
// state transitions, and the job-state store. Download workers stream to a
// temp sibling and rename atomically on success; a heartbeat keeps
// `updated_at` fresh every 5 seconds so stale detection works even when the
// remote reports no content length.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, Semaphore};

use crate::config::Settings;
use crate::error::{AppError, AppResult};
use crate::models::jobs::{JobStore, ModelStatus, STALE_DOWNLOAD_MINUTES};
use crate::models::registry::{self, spec_for, supported_models, ModelSpec};
use crate::whisper::WhisperClient;

/// At most this many model downloads run at once, across all models.
const GLOBAL_DOWNLOAD_CAP: usize = 2;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const DOWNLOAD_STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-model lock acquisition bound; it only guards state transitions, so
/// anything longer means another holder is wedged.
const MODEL_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

const TIMEOUT_MESSAGE: &str = "Download exceeded time limit; please retry.";

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub size_mb: f64,
    pub is_downloaded: bool,
    pub is_active: bool,
    pub status: ModelStatus,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub version: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadOutcome {
    Downloaded,
    DownloadStarted,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectOutcome {
    pub status: &'static str,
    pub active_model: String,
    pub model_path: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct ModelPreference {
    model_name: String,
}

pub struct ModelManager {
    settings: Arc<Settings>,
    jobs: JobStore,
    client: Arc<WhisperClient>,
    downloads: Arc<Semaphore>,
    model_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    active: RwLock<String>,
}

impl ModelManager {
    pub fn new(settings: Arc<Settings>, client: Arc<WhisperClient>) -> Self {
        let jobs = JobStore::new(settings.model_jobs_path());
        let active = read_preference(&settings.model_preference_path())
            .unwrap_or_else(|| "base".to_string());
        Self {
            settings,
            jobs,
            client,
            downloads: Arc::new(Semaphore::new(GLOBAL_DOWNLOAD_CAP)),
            model_locks: DashMap::new(),
            active: RwLock::new(active),
        }
    }

    pub async fn active_model(&self) -> String {
        self.active.read().await.clone()
    }

    /// Supported models with status derived from on-disk presence overlaid
    /// with the persisted job record.
    pub async fn list(&self) -> Vec<ModelInfo> {
        let job_state = self.jobs.load().await;
        let active = self.active.read().await.clone();

        supported_models()
            .iter()
            .map(|spec| {
                let cached = self.settings.model_path(&spec.file_name()).is_some();
                let entry = job_state.get(spec.name);

                let mut status = entry.map(|e| e.status).unwrap_or(ModelStatus::Idle);
                let mut progress = entry.and_then(|e| e.progress);
                let mut message = entry.and_then(|e| e.message.clone());
                let mut version = entry.and_then(|e| e.version.clone());
                let mut is_downloaded = cached;

                // Cached file built from an older version pin must be
                // re-downloaded before use.
                let version_mismatch = cached
                    && version
                        .as_deref()
                        .is_some_and(|v| v != spec.version);
                if version_mismatch {
                    status = ModelStatus::NeedsUpdate;
                    message = Some("Model cache outdated. Please re-download.".to_string());
                    is_downloaded = false;
                } else {
                    match status {
                        // Stale downloads were already normalized by the
                        // store on load; anything still downloading is live.
                        ModelStatus::Downloading => {
                            is_downloaded = false;
                        }
                        ModelStatus::Error => {
                            is_downloaded = false;
                        }
                        _ if cached => {
                            status = ModelStatus::Downloaded;
                            progress = Some(1.0);
                            if version.is_none() {
                                version = Some(spec.version.to_string());
                            }
                        }
                        _ => {
                            status = ModelStatus::Idle;
                        }
                    }
                }

                ModelInfo {
                    name: spec.name.to_string(),
                    size_mb: spec.size_mb,
                    is_downloaded,
                    is_active: spec.name == active,
                    status,
                    progress,
                    message,
                    version,
                    updated_at: entry.map(|e| e.updated_at),
                }
            })
            .collect()
    }

    /// Start a background download, or report it is already cached.
    pub async fn download(&self, name: &str) -> AppResult<DownloadOutcome> {
        let spec = spec_for(name).ok_or_else(|| {
            AppError::Validation(format!(
                "Invalid model name. Supported: {}",
                registry::supported_names()
            ))
        })?;

        let current = self.jobs.entry(name).await;
        let current_status = current.as_ref().map(|e| e.status);

        if current_status == Some(ModelStatus::Downloading) {
            return Err(AppError::Conflict("Download already in progress".into()));
        }

        let cached = self.settings.model_path(&spec.file_name()).is_some();
        if cached
            && !matches!(
                current_status,
                Some(ModelStatus::Error) | Some(ModelStatus::NeedsUpdate)
            )
        {
            self.jobs
                .mark(
                    name,
                    ModelStatus::Downloaded,
                    Some(1.0),
                    None,
                    Some(spec.version.to_string()),
                )
                .await;
            return Ok(DownloadOutcome::Downloaded);
        }

        // Zero-wait acquire: a saturated cap is a client-visible conflict,
        // not a queue.
        let permit = self
            .downloads
            .clone()
            .try_acquire_owned()
            .map_err(|_| {
                AppError::Conflict("Global download limit reached. Please retry.".into())
            })?;

        let lock = self
            .model_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        {
            let _guard = tokio::time::timeout(MODEL_LOCK_TIMEOUT, lock.lock())
                .await
                .map_err(|_| AppError::Conflict("Another download lock is held".into()))?;
            // Re-check under the model lock: a racing request may have won
            // the transition between our first read and here.
            if self
                .jobs
                .entry(name)
                .await
                .is_some_and(|e| e.status == ModelStatus::Downloading)
            {
                return Err(AppError::Conflict("Download already in progress".into()));
            }
            self.jobs
                .mark(
                    name,
                    ModelStatus::Downloading,
                    Some(0.0),
                    None,
                    Some(spec.version.to_string()),
                )
                .await;
        }

        let worker = DownloadWorker {
            spec: *spec,
            target_dir: self.settings.user_models_dir(),
            jobs_path: self.settings.model_jobs_path(),
        };
        tokio::spawn(async move {
            worker.run().await;
            // Permit released exactly once, on every path out of the worker.
            drop(permit);
        });

        Ok(DownloadOutcome::DownloadStarted)
    }

    /// Persist the preference and hot-swap the server's model.
    pub async fn select(&self, name: &str) -> AppResult<SelectOutcome> {
        let spec = spec_for(name).ok_or_else(|| {
            AppError::Validation(format!(
                "Invalid model name. Supported: {}",
                registry::supported_names()
            ))
        })?;

        let model_path = self
            .settings
            .model_path(&spec.file_name())
            .ok_or_else(|| {
                AppError::Validation("Model not downloaded. Please download first.".into())
            })?;

        if let Some(entry) = self.jobs.entry(name).await {
            if matches!(entry.status, ModelStatus::Error | ModelStatus::NeedsUpdate) {
                return Err(AppError::Validation(
                    "Model is unavailable; please re-download before selecting.".into(),
                ));
            }
        }

        // Preference is saved before the swap; a failed hot-swap leaves the
        // saved preference in place for the next server start.
        if let Err(e) = write_preference(&self.settings.model_preference_path(), name) {
            log::error!("failed to save model preference: {e}");
        }

        self.client
            .load_model(&model_path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to load model: {e}")))?;

        self.jobs
            .mark(
                name,
                ModelStatus::Downloaded,
                Some(1.0),
                None,
                Some(spec.version.to_string()),
            )
            .await;
        *self.active.write().await = name.to_string();
        log::info!("model {name} loaded via /load and marked active");

        Ok(SelectOutcome {
            status: "ok",
            active_model: name.to_string(),
            model_path: model_path.display().to_string(),
        })
    }

    #[cfg(test)]
    fn exhaust_permits(&self) -> Vec<tokio::sync::OwnedSemaphorePermit> {
        let mut held = Vec::new();
        while let Ok(p) = self.downloads.clone().try_acquire_owned() {
            held.push(p);
        }
        held
    }
}

/// One background download: stream to `<file>.tmp`, rename on success, mark
/// terminal state in the shared job file. Owns its own JobStore handle so the
/// worker outlives request state.
struct DownloadWorker {
    spec: ModelSpec,
    target_dir: PathBuf,
    jobs_path: PathBuf,
}

impl DownloadWorker {
    async fn run(self) {
        let jobs = JobStore::new(self.jobs_path.clone());
        let target = self.target_dir.join(self.spec.file_name());
        let tmp = target.with_extension("bin.tmp");

        let downloaded = Arc::new(AtomicU64::new(0));
        let total = Arc::new(AtomicU64::new(0));

        let budget = Duration::from_secs(STALE_DOWNLOAD_MINUTES as u64 * 60);
        let fetch = fetch_to_temp(
            self.spec.url,
            tmp.clone(),
            downloaded.clone(),
            total.clone(),
        );
        tokio::pin!(fetch);

        let deadline = tokio::time::sleep(budget);
        tokio::pin!(deadline);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                result = &mut fetch => break result,
                _ = &mut deadline => break Err(anyhow!(TIMEOUT_MESSAGE)),
                _ = heartbeat.tick() => {
                    let done = downloaded.load(Ordering::Relaxed);
                    let want = total.load(Ordering::Relaxed);
                    let progress = if want > 0 {
                        Some((done as f64 / want as f64).min(1.0))
                    } else {
                        None
                    };
                    jobs.mark(
                        self.spec.name,
                        ModelStatus::Downloading,
                        progress,
                        None,
                        Some(self.spec.version.to_string()),
                    )
                    .await;
                }
            }
        };

        match result {
            Ok(()) => match tokio::fs::rename(&tmp, &target).await {
                Ok(()) => {
                    log::info!(
                        "model {} downloaded to {}",
                        self.spec.name,
                        target.display()
                    );
                    jobs.mark(
                        self.spec.name,
                        ModelStatus::Downloaded,
                        Some(1.0),
                        None,
                        Some(self.spec.version.to_string()),
                    )
                    .await;
                }
                Err(e) => {
                    log::error!("failed to finalize model {}: {e}", self.spec.name);
                    let _ = tokio::fs::remove_file(&tmp).await;
                    jobs.mark(
                        self.spec.name,
                        ModelStatus::Error,
                        None,
                        Some("Could not finalize downloaded file; please retry.".to_string()),
                        None,
                    )
                    .await;
                }
            },
            Err(e) => {
                log::error!("download job failed for {}: {e}", self.spec.name);
                let _ = tokio::fs::remove_file(&tmp).await;
                jobs.mark(
                    self.spec.name,
                    ModelStatus::Error,
                    None,
                    Some(short_error_message(&e)),
                    None,
                )
                .await;
            }
        }
    }
}

async fn fetch_to_temp(
    url: &str,
    tmp: PathBuf,
    downloaded: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
) -> Result<()> {
    if let Some(parent) = tmp.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let client = reqwest::Client::builder()
        .connect_timeout(DOWNLOAD_STREAM_CONNECT_TIMEOUT)
        .build()
        .context("failed to build download client")?;

    let response = client
        .get(url)
        .send()
        .await
        .context("failed to start download")?;
    if !response.status().is_success() {
        return Err(anyhow!("download failed with status {}", response.status()));
    }
    if let Some(len) = response.content_length() {
        total.store(len, Ordering::Relaxed);
    }

    let file = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("failed to create {}", tmp.display()))?;
    let mut writer = tokio::io::BufWriter::with_capacity(8 * 1024 * 1024, file);

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("download stream interrupted")?;
        writer
            .write_all(&chunk)
            .await
            .context("error writing model file")?;
        downloaded.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }
    writer.flush().await?;
    Ok(())
}

fn short_error_message(err: &anyhow::Error) -> String {
    let text = err.to_string();
    if text.contains(TIMEOUT_MESSAGE) {
        TIMEOUT_MESSAGE.to_string()
    } else if text.contains("connect") || text.contains("Connection") {
        "Connection failed - Check your internet".to_string()
    } else if text.contains("interrupted") {
        "Stream interrupted - Network unstable".to_string()
    } else {
        "Download error".to_string()
    }
}

fn read_preference(path: &std::path::Path) -> Option<String> {
    let raw = std::fs::read(path).ok()?;
    serde_json::from_slice::<ModelPreference>(&raw)
        .ok()
        .map(|p| p.model_name)
}

fn write_preference(path: &std::path::Path, name: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec(&ModelPreference {
        model_name: name.to_string(),
    })?;
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &std::path::Path) -> Arc<Settings> {
        Arc::new(Settings {
            data_dir: dir.to_path_buf(),
            desktop_mode: false,
            bundled_models_dir: None,
            live_transcription: true,
            live_mic: true,
            live_batch_only: false,
            live_chunk_sec: 3600.0,
            live_stride_sec: 60.0,
            force_language: None,
            max_upload_bytes: 1024,
            host: "127.0.0.1".into(),
            port: 8000,
        })
    }

    fn manager(dir: &std::path::Path) -> ModelManager {
        let settings = settings(dir);
        let client = Arc::new(WhisperClient::new(&settings));
        ModelManager::new(settings, client)
    }

    #[tokio::test]
    async fn unknown_model_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = manager(dir.path()).download("enormous").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn cached_model_short_circuits_without_worker() {
        let dir = tempfile::tempdir().unwrap();
        let models_dir = dir.path().join("models");
        std::fs::create_dir_all(&models_dir).unwrap();
        std::fs::write(models_dir.join("ggml-base.en.bin"), b"ggml").unwrap();

        let mgr = manager(dir.path());
        let outcome = mgr.download("base").await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Downloaded);

        // No permit may be held after the short-circuit.
        assert_eq!(mgr.downloads.available_permits(), GLOBAL_DOWNLOAD_CAP);

        let listed = mgr.list().await;
        let base = listed.iter().find(|m| m.name == "base").unwrap();
        assert!(base.is_downloaded);
        assert_eq!(base.status, ModelStatus::Downloaded);
        assert_eq!(base.progress, Some(1.0));
    }

    #[tokio::test]
    async fn saturated_global_cap_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let _held = mgr.exhaust_permits();
        let err = mgr.download("tiny").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn in_flight_download_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.jobs
            .mark("small", ModelStatus::Downloading, Some(0.5), None, None)
            .await;
        let err = mgr.download("small").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn list_reports_idle_for_unknown_state() {
        let dir = tempfile::tempdir().unwrap();
        let listed = manager(dir.path()).list().await;
        assert_eq!(listed.len(), 3);
        assert!(listed.iter().all(|m| m.status == ModelStatus::Idle));
        assert!(listed.iter().any(|m| m.name == "base" && m.is_active));
    }

    #[tokio::test]
    async fn version_drift_surfaces_needs_update() {
        let dir = tempfile::tempdir().unwrap();
        let models_dir = dir.path().join("models");
        std::fs::create_dir_all(&models_dir).unwrap();
        std::fs::write(models_dir.join("ggml-tiny.en.bin"), b"ggml").unwrap();

        let mgr = manager(dir.path());
        mgr.jobs
            .mark(
                "tiny",
                ModelStatus::Downloaded,
                Some(1.0),
                None,
                Some("v0-legacy".into()),
            )
            .await;

        let listed = mgr.list().await;
        let tiny = listed.iter().find(|m| m.name == "tiny").unwrap();
        assert_eq!(tiny.status, ModelStatus::NeedsUpdate);
        assert!(!tiny.is_downloaded);
    }

    #[tokio::test]
    async fn select_requires_downloaded_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = manager(dir.path()).select("base").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn preference_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_preference.json");
        write_preference(&path, "small").unwrap();
        assert_eq!(read_preference(&path).as_deref(), Some("small"));
    }
}
