// Persisted per-model download state.
//
// One JSON file maps model name -> job record. Writes go through a temp file
// plus atomic rename, so the file is always either the prior snapshot or the
// new one. Reads normalize stale `downloading` entries to `error` so a
// crashed worker can never leave a model stuck.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// A `downloading` record with no heartbeat for this long is treated as dead.
pub const STALE_DOWNLOAD_MINUTES: i64 = 15;

pub const STALE_MESSAGE: &str = "Download timed out; please retry.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Idle,
    Downloading,
    Downloaded,
    Error,
    NeedsUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    pub status: ModelStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobEntry {
    pub fn new(status: ModelStatus) -> Self {
        Self {
            status,
            progress: None,
            message: None,
            version: None,
            updated_at: Utc::now(),
        }
    }

    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == ModelStatus::Downloading
            && now - self.updated_at > Duration::minutes(STALE_DOWNLOAD_MINUTES)
    }
}

/// Single-writer store for the job-state file.
pub struct JobStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JobStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Snapshot of the current state, with stale entries normalized (and the
    /// normalization persisted).
    pub async fn load(&self) -> HashMap<String, JobEntry> {
        let _guard = self.lock.lock().await;
        let mut state = self.read_unlocked().await;
        if normalize_stale(&mut state, Utc::now()) {
            if let Err(e) = self.write_unlocked(&state).await {
                log::warn!("failed to persist normalized model job state: {e}");
            }
        }
        state
    }

    /// Read-modify-write a single model's record.
    pub async fn mark(
        &self,
        model_name: &str,
        status: ModelStatus,
        progress: Option<f64>,
        message: Option<String>,
        version: Option<String>,
    ) {
        let _guard = self.lock.lock().await;
        let mut state = self.read_unlocked().await;
        normalize_stale(&mut state, Utc::now());
        state.insert(
            model_name.to_string(),
            JobEntry {
                status,
                progress,
                message,
                version,
                updated_at: Utc::now(),
            },
        );
        if let Err(e) = self.write_unlocked(&state).await {
            log::warn!("failed to persist model job state: {e}");
        }
    }

    pub async fn entry(&self, model_name: &str) -> Option<JobEntry> {
        self.load().await.get(model_name).cloned()
    }

    async fn read_unlocked(&self) -> HashMap<String, JobEntry> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    log::warn!("unparseable model job state, starting fresh: {e}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        }
    }

    async fn write_unlocked(&self, state: &HashMap<String, JobEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(state)?;
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

fn normalize_stale(state: &mut HashMap<String, JobEntry>, now: DateTime<Utc>) -> bool {
    let mut changed = false;
    for entry in state.values_mut() {
        if entry.is_stale(now) {
            entry.status = ModelStatus::Error;
            entry.message = Some(STALE_MESSAGE.to_string());
            entry.progress = None;
            entry.updated_at = now;
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mark_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path().join("model_jobs.json"));

        store
            .mark(
                "base",
                ModelStatus::Downloading,
                Some(0.0),
                None,
                Some("main".into()),
            )
            .await;

        let state = store.load().await;
        let entry = state.get("base").unwrap();
        assert_eq!(entry.status, ModelStatus::Downloading);
        assert_eq!(entry.version.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn stale_downloading_normalizes_to_error_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_jobs.json");

        // Simulate a worker that died 30 minutes ago.
        let mut state = HashMap::new();
        state.insert(
            "base".to_string(),
            JobEntry {
                status: ModelStatus::Downloading,
                progress: Some(0.4),
                message: None,
                version: Some("main".into()),
                updated_at: Utc::now() - Duration::minutes(30),
            },
        );
        std::fs::write(&path, serde_json::to_vec(&state).unwrap()).unwrap();

        let store = JobStore::new(path.clone());
        let loaded = store.load().await;
        let entry = loaded.get("base").unwrap();
        assert_eq!(entry.status, ModelStatus::Error);
        assert_eq!(entry.message.as_deref(), Some(STALE_MESSAGE));
        assert!(entry.progress.is_none());

        // The normalization must have been written back.
        let on_disk: HashMap<String, JobEntry> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk.get("base").unwrap().status, ModelStatus::Error);
    }

    #[tokio::test]
    async fn fresh_downloading_entry_survives_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path().join("model_jobs.json"));
        store
            .mark("tiny", ModelStatus::Downloading, Some(0.2), None, None)
            .await;
        let state = store.load().await;
        assert_eq!(state.get("tiny").unwrap().status, ModelStatus::Downloading);
    }

    #[tokio::test]
    async fn corrupt_file_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_jobs.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = JobStore::new(path);
        assert!(store.load().await.is_empty());
    }
}
