// Live transcription plumbing: the per-session event bus feeding SSE
// subscribers, and the microphone session manager.

mod events;
mod sessions;

pub use events::{sse_format, EventBus, LiveEvent};
pub use sessions::{LiveSessionManager, PushOutcome, StopOutcome};
