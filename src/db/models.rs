// Row types for the three core tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Call lifecycle; only the orchestrator and the live-session finalizer
/// mutate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Uploaded,
    Processing,
    Transcribing,
    Transcribed,
    Completed,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Uploaded => "uploaded",
            CallStatus::Processing => "processing",
            CallStatus::Transcribing => "transcribing",
            CallStatus::Transcribed => "transcribed",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CallRow {
    pub id: i64,
    pub call_id: String,
    pub file_path: Option<String>,
    pub original_filename: Option<String>,
    pub file_size_bytes: Option<i64>,
    pub duration: Option<f64>,
    pub status: String,
    pub error: Option<String>,
    pub audio_format: Option<String>,
    pub sample_rate: Option<i64>,
    pub channels: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TranscriptRow {
    pub id: i64,
    pub call_id: String,
    pub text: String,
    pub language: Option<String>,
    pub confidence: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AnalysisRow {
    pub id: i64,
    pub call_id: String,
    pub intent: Option<String>,
    pub intent_confidence: i64,
    pub sentiment: Option<String>,
    pub sentiment_score: i64,
    pub escalation_risk: Option<String>,
    pub risk_score: i64,
    pub urgency_level: Option<String>,
    pub compliance_risk: Option<String>,
    /// JSON-encoded ordered list of strings.
    pub keywords: String,
    /// JSON-encoded ordered list of strings.
    pub topics: String,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new call row.
#[derive(Debug, Clone)]
pub struct NewCall {
    pub call_id: String,
    pub file_path: String,
    pub original_filename: String,
    pub file_size_bytes: i64,
    pub duration: Option<f64>,
}

/// Fields for a new analysis row.
#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub intent: String,
    pub intent_confidence: i64,
    pub sentiment: String,
    pub sentiment_score: i64,
    pub escalation_risk: String,
    pub risk_score: i64,
    pub urgency_level: String,
    pub compliance_risk: String,
    pub keywords: Vec<String>,
    pub topics: Vec<String>,
}
