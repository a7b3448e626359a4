// Model registry and background download management for the whisper.cpp
// model files.

mod jobs;
mod manager;
mod registry;

pub use jobs::{JobEntry, JobStore, ModelStatus, STALE_DOWNLOAD_MINUTES};
pub use manager::{DownloadOutcome, ModelInfo, ModelManager, SelectOutcome};
pub use registry::{spec_for, supported_models, ModelSpec};
