mod monitor;
mod orchestrator;

pub use monitor::{Alert, PipelineMonitor, StageMetrics};
pub use orchestrator::{PipelineOrchestrator, PipelineOutcome, StageTiming, StageTimings};
