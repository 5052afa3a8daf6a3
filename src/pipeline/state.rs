//! Per-job state machine: `queued -> active -> {completed | failed}`, with
//! `active -> queued` for automatic retries and `failed -> queued` for manual ones.

use chrono::{DateTime, Utc};

use crate::core::{PipelineError, PipelineResult};
use crate::models::{Checkpoint, Job, JobState, JobStatus};

#[derive(Debug, Clone)]
pub struct JobEntry {
    pub job: Job,
    pub state: JobState,
    pub progress: u8,
    pub checkpoint: Option<Checkpoint>,
    pub error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Attempts made before the current retry budget started.
    pub budget_start: u32,
    pub updated_at: DateTime<Utc>,
}

fn allowed(from: JobState, to: JobState) -> bool {
    use JobState::*;
    matches!(
        (from, to),
        (Queued, Active) | (Queued, Failed) | (Active, Completed) | (Active, Failed) | (Active, Queued) | (Failed, Queued)
    )
}

impl JobEntry {
    pub fn new(job: Job) -> Self {
        JobEntry {
            job,
            state: JobState::Queued,
            progress: 0,
            checkpoint: None,
            error: None,
            next_attempt_at: None,
            budget_start: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn transition(&mut self, to: JobState) -> PipelineResult<()> {
        if !allowed(self.state, to) {
            return Err(PipelineError::InvalidTransition(format!(
                "job {} cannot go from {:?} to {:?}",
                self.job.id, self.state, to
            )));
        }
        match to {
            JobState::Active => {
                self.job.attempts_made += 1;
                self.progress = 0;
                self.checkpoint = None;
                self.error = None;
                self.next_attempt_at = None;
            }
            JobState::Completed => self.next_attempt_at = None,
            JobState::Queued | JobState::Failed => {}
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a finished checkpoint. Checkpoints only move forward within an attempt.
    pub fn advance(&mut self, checkpoint: Checkpoint) -> PipelineResult<()> {
        if self.state != JobState::Active {
            return Err(PipelineError::InvalidTransition(format!(
                "job {} is {:?}, not active",
                self.job.id, self.state
            )));
        }
        if self.checkpoint.map(|current| checkpoint <= current).unwrap_or(false) {
            return Err(PipelineError::InvalidTransition(format!(
                "checkpoint {} after {:?}",
                checkpoint, self.checkpoint
            )));
        }
        self.checkpoint = Some(checkpoint);
        self.progress = checkpoint.progress();
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, JobState::Completed | JobState::Failed)
    }

    /// Attempts made in the current retry budget.
    pub fn attempts_in_budget(&self) -> u32 {
        self.job.attempts_made.saturating_sub(self.budget_start)
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.job.id,
            invoice_id: self.job.invoice_id,
            state: self.state,
            progress: self.progress,
            checkpoint: self.checkpoint,
            attempts_made: self.job.attempts_made,
            error: self.error.clone(),
            next_attempt_at: self.next_attempt_at,
            updated_at: self.updated_at,
        }
    }
}
