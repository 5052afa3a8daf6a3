use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::Priority;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub priority: Priority,
    pub preferred_provider: Option<String>,
    pub auto_fix: bool,
    pub skip_validation: bool,
}

/// Upstream request to process an uploaded file already placed in blob storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub owner_id: Uuid,
    pub file_key: String,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: u64,
    #[serde(default)]
    pub options: JobOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: Uuid,
    pub invoice_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub owner_id: Uuid,
    pub file_key: String,
    pub file_name: String,
    pub mime_type: String,
    pub options: JobOptions,
    pub attempts_made: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

/// Ordered progress checkpoints inside an active attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    Download,
    Extraction,
    RecordUpdate,
    LineItems,
    Validation,
    Generation,
    Completion,
}

impl Checkpoint {
    pub const ALL: [Checkpoint; 7] = [
        Checkpoint::Download,
        Checkpoint::Extraction,
        Checkpoint::RecordUpdate,
        Checkpoint::LineItems,
        Checkpoint::Validation,
        Checkpoint::Generation,
        Checkpoint::Completion,
    ];

    /// Percent reported once this checkpoint has finished.
    pub fn progress(&self) -> u8 {
        match self {
            Checkpoint::Download => 10,
            Checkpoint::Extraction => 50,
            Checkpoint::RecordUpdate => 60,
            Checkpoint::LineItems => 70,
            Checkpoint::Validation => 80,
            Checkpoint::Generation => 90,
            Checkpoint::Completion => 100,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Checkpoint::Download => "download",
            Checkpoint::Extraction => "extraction",
            Checkpoint::RecordUpdate => "record_update",
            Checkpoint::LineItems => "line_items",
            Checkpoint::Validation => "validation",
            Checkpoint::Generation => "generation",
            Checkpoint::Completion => "completion",
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: Uuid,
    pub invoice_id: Uuid,
    pub state: JobState,
    pub progress: u8,
    pub checkpoint: Option<Checkpoint>,
    pub attempts_made: u32,
    pub error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}
