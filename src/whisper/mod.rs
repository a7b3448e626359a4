// Client stack for the co-located whisper.cpp server: one-shot transcription
// with hallucination dedup, plus the windowed driver for long audio.

mod chunked;
mod client;
pub mod dedup;

pub use chunked::{ChunkPartial, ChunkSummary, ChunkedTranscriber};
pub use client::{
    confidence_score, HealthSnapshot, HealthStatus, TranscribeOptions, TranscriptionOutcome,
    TranscriptionSegment, WhisperClient,
};
