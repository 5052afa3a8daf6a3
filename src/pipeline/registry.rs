use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;
use uuid::Uuid;

use super::cancel::CancelToken;
use super::state::JobEntry;
use crate::core::{PipelineError, PipelineResult};
use crate::models::{Job, JobState, JobStats, JobStatus};

/// In-process job table shared by the API and the workers.
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<Uuid, JobEntry>,
    tokens: DashMap<Uuid, CancelToken>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.insert(job.id, token.clone());
        self.jobs.insert(job.id, JobEntry::new(job));
        token
    }

    pub fn status(&self, id: Uuid) -> PipelineResult<JobStatus> {
        self.jobs.get(&id).map(|e| e.status()).ok_or_else(|| not_found(id))
    }

    pub fn token(&self, id: Uuid) -> PipelineResult<CancelToken> {
        self.tokens.get(&id).map(|t| t.clone()).ok_or_else(|| not_found(id))
    }

    /// Fresh token for a manually retried job.
    pub fn renew_token(&self, id: Uuid) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.insert(id, token.clone());
        token
    }

    /// Remove the token of a job that reached a terminal state.
    pub fn release_token(&self, id: Uuid) -> Option<CancelToken> {
        self.tokens.remove(&id).map(|(_, token)| token)
    }

    /// Mutate one entry under its shard lock.
    pub fn update<R>(&self, id: Uuid, f: impl FnOnce(&mut JobEntry) -> PipelineResult<R>) -> PipelineResult<R> {
        let mut entry = self.jobs.get_mut(&id).ok_or_else(|| not_found(id))?;
        f(&mut entry)
    }

    /// Ids of jobs waiting in the queue or in a retry backoff.
    pub fn queued(&self) -> Vec<Uuid> {
        self.jobs
            .iter()
            .filter(|e| e.state == JobState::Queued)
            .map(|e| e.job.id)
            .collect()
    }

    /// Drop terminal jobs last updated more than `retention` before `now`, then the oldest
    /// terminal jobs beyond `keep`. Returns how many were removed.
    pub fn evict_terminal(&self, retention: Duration, keep: usize, now: DateTime<Utc>) -> usize {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| now.checked_sub_signed(r))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut terminal: Vec<(DateTime<Utc>, Uuid)> = self
            .jobs
            .iter()
            .filter(|e| e.is_terminal())
            .map(|e| (e.updated_at, e.job.id))
            .collect();
        terminal.sort();

        let excess = terminal.len().saturating_sub(keep);
        let mut removed = 0;
        for (i, (updated_at, id)) in terminal.into_iter().enumerate() {
            if i >= excess && updated_at > cutoff {
                continue;
            }
            // A manual retry may have re-queued it since the scan.
            if self.jobs.remove_if(&id, |_, e| e.is_terminal()).is_some() {
                self.tokens.remove(&id);
                removed += 1;
            }
        }
        removed
    }

    pub fn stats(&self) -> JobStats {
        let mut stats = JobStats::default();
        for entry in self.jobs.iter() {
            match entry.state {
                JobState::Queued => stats.queued += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

fn not_found(id: Uuid) -> PipelineError {
    PipelineError::NotFound(format!("job {}", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobOptions;
    use pretty_assertions::assert_eq;

    fn job() -> Job {
        Job {
            id: Uuid::new_v4(),
            invoice_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            file_key: "uploads/a.pdf".into(),
            file_name: "a.pdf".into(),
            mime_type: "application/pdf".into(),
            options: JobOptions::default(),
            attempts_made: 0,
            created_at: Utc::now(),
        }
    }

    fn finish(registry: &JobRegistry, id: Uuid, state: JobState, updated_at: DateTime<Utc>) {
        registry
            .update(id, |e| {
                e.transition(JobState::Active)?;
                e.transition(state)?;
                e.updated_at = updated_at;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_evicts_terminal_jobs_past_retention() {
        let registry = JobRegistry::new();
        let now = Utc::now();
        let (old, recent, waiting) = (job(), job(), job());
        let (old_id, recent_id, waiting_id) = (old.id, recent.id, waiting.id);
        for j in [old, recent, waiting] {
            registry.insert(j);
        }
        finish(&registry, old_id, JobState::Completed, now - chrono::Duration::hours(2));
        finish(&registry, recent_id, JobState::Failed, now - chrono::Duration::minutes(5));

        let removed = registry.evict_terminal(Duration::from_secs(3600), 100, now);

        assert_eq!(removed, 1);
        assert!(matches!(registry.status(old_id), Err(PipelineError::NotFound(_))));
        assert!(registry.token(old_id).is_err());
        assert_eq!(registry.status(recent_id).unwrap().state, JobState::Failed);
        assert_eq!(registry.status(waiting_id).unwrap().state, JobState::Queued);
    }

    #[test]
    fn test_keeps_only_the_newest_terminal_jobs() {
        let registry = JobRegistry::new();
        let now = Utc::now();
        let ids: Vec<Uuid> = (0..5)
            .map(|i| {
                let j = job();
                let id = j.id;
                registry.insert(j);
                finish(&registry, id, JobState::Completed, now - chrono::Duration::seconds(10 - i));
                id
            })
            .collect();

        let removed = registry.evict_terminal(Duration::from_secs(3600), 2, now);

        assert_eq!(removed, 3);
        assert_eq!(registry.stats().completed, 2);
        assert!(registry.status(ids[3]).is_ok());
        assert!(registry.status(ids[4]).is_ok());
    }

    #[test]
    fn test_released_token_is_gone() {
        let registry = JobRegistry::new();
        let j = job();
        let id = j.id;
        registry.insert(j);

        assert!(registry.release_token(id).is_some());
        assert!(registry.token(id).is_err());
        assert_eq!(registry.queued(), vec![id]);
    }
}
