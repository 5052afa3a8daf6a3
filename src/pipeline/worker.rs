//! Worker pool: pulls job ids off the queue and runs one attempt per job through the checkpoints.
//! The download checkpoint also archives the upload under the invoice's source-document key.

use chrono::Utc;
use governor::{Quota, RateLimiter};
use serde_json::{json, Value};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::cancel::{guarded, CancelToken};
use super::service::{Pipeline, SHUTDOWN_MESSAGE};
use crate::core::{CriticalOutcome, PipelineError, PipelineResult};
use crate::metrics;
use crate::models::{Checkpoint, ExtractionOptions, InvoiceStatus, Job, JobState, MediaType, ProcessingLogEntry};
use crate::storage::{generated_document_key, source_document_key};

enum Next {
    Retry(Duration),
    Fail(String),
}

impl Pipeline {
    /// Spawn the dispatcher and the eviction loop. The handle resolves after `shutdown`
    /// once in-flight attempts finish.
    pub fn start(&self) -> JoinHandle<()> {
        let evictor = self.clone();
        tokio::spawn(async move { evictor.evict_periodically().await });
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.dispatch().await })
    }

    async fn evict_periodically(self) {
        let period = Duration::from_secs(self.inner.config.job_retention_secs.clamp(1, 60));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.inner.queue.is_closed() {
                break;
            }
            self.evict_finished_jobs();
        }
    }

    async fn dispatch(self) {
        let workers = self.inner.config.workers.max(1);
        let per_second = NonZeroU32::new(self.inner.config.jobs_per_second.max(1)).unwrap_or(NonZeroU32::MIN);
        let limiter = RateLimiter::direct(Quota::per_second(per_second));
        let semaphore = Arc::new(Semaphore::new(workers));
        info!(workers, jobs_per_second = per_second.get(), "job dispatcher started");

        loop {
            // Take a slot first so the queue keeps ordering jobs while every worker is busy.
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let Some(job_id) = self.inner.queue.pop().await else {
                break;
            };
            limiter.until_ready().await;

            let pipeline = self.clone();
            tokio::spawn(async move {
                pipeline.process(job_id).await;
                drop(permit);
            });
        }

        let _ = semaphore.acquire_many(workers as u32).await;
        let stranded = self.inner.registry.queued();
        for job_id in &stranded {
            self.abandon(*job_id, SHUTDOWN_MESSAGE).await;
        }
        info!(abandoned = stranded.len(), "job dispatcher stopped");
    }

    #[instrument(skip(self))]
    async fn process(&self, job_id: Uuid) {
        let activated = self.inner.registry.update(job_id, |entry| {
            if entry.state != JobState::Queued {
                return Ok(None);
            }
            entry.transition(JobState::Active)?;
            Ok(Some(entry.job.clone()))
        });
        let job = match activated {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!("job no longer queued, skipping");
                return;
            }
            Err(e) => {
                warn!(error = %e, "could not activate job");
                return;
            }
        };
        let token = match self.inner.registry.token(job_id) {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "job has no cancel token");
                return;
            }
        };

        info!(attempt = job.attempts_made, invoice_id = %job.invoice_id, "attempt started");
        let started = Instant::now();

        match self.run_attempt(&job, &token).await {
            Ok(()) => match self.inner.registry.update(job_id, |e| e.transition(JobState::Completed)) {
                Ok(()) => {
                    self.inner.registry.release_token(job_id);
                    metrics::JOBS_COMPLETED.inc();
                    info!(elapsed_ms = started.elapsed().as_millis() as u64, "job completed");
                }
                Err(e) => warn!(error = %e, "job finished but could not be completed"),
            },
            Err(PipelineError::Cancelled) => info!("attempt stopped: job cancelled"),
            Err(e) => self.handle_failure(&job, e).await,
        }
    }

    async fn run_attempt(&self, job: &Job, token: &CancelToken) -> PipelineResult<()> {
        let deps = &self.inner.deps;
        let config = &self.inner.config;
        let deadline = Instant::now() + Duration::from_secs(config.job_timeout_secs);
        let attempt_started = Utc::now();
        let source_key = source_document_key(job.owner_id, job.invoice_id, &job.file_name);

        let bytes = self
            .step(job, token, deadline, Checkpoint::Download, async {
                let bytes = deps
                    .blobs
                    .get(&job.file_key)
                    .await
                    .map_err(|e| PipelineError::DownloadFailed(e.to_string()))?;
                if job.file_key != source_key {
                    deps.blobs
                        .put(&source_key, bytes.clone(), &job.mime_type)
                        .await
                        .map_err(|e| PipelineError::UploadFailed(e.to_string()))?;
                }
                Ok::<_, PipelineError>((json!({ "bytes": bytes.len(), "source_key": source_key }), bytes))
            })
            .await?;

        let options = ExtractionOptions {
            preferred_provider: job.options.preferred_provider.clone(),
            owner_id: Some(job.owner_id),
            media_type: MediaType::from_mime(&job.mime_type),
            ..ExtractionOptions::default()
        };
        let extraction = self
            .step(job, token, deadline, Checkpoint::Extraction, async {
                let result = deps.extractor.extract(&bytes, &job.file_name, &options).await?;
                let detail = json!({
                    "source": result.source,
                    "confidence": result.confidence,
                    "warnings": result.warnings,
                });
                Ok::<_, PipelineError>((detail, result))
            })
            .await?;

        let mut record = self
            .step(job, token, deadline, Checkpoint::RecordUpdate, async {
                let mut record = deps.records.get_invoice(job.invoice_id).await?;
                record.invoice.apply_extraction(&extraction.fields);
                record.ocr_confidence = Some(extraction.confidence);
                record.source_document_key = Some(source_key.clone());
                record.processing_started_at = Some(attempt_started);
                record.error_message = None;
                deps.records.update_invoice(&record).await?;
                Ok::<_, PipelineError>((json!({ "confidence": extraction.confidence }), record))
            })
            .await?;

        self.step(job, token, deadline, Checkpoint::LineItems, async {
            deps.records
                .replace_line_items(job.invoice_id, &record.invoice.line_items)
                .await?;
            Ok::<_, PipelineError>((json!({ "count": record.invoice.line_items.len() }), ()))
        })
        .await?;

        let validation = self
            .step(job, token, deadline, Checkpoint::Validation, async {
                if job.options.skip_validation {
                    return Ok((json!({ "skipped": true }), None));
                }
                let mut result = deps.validator.validate(&record.invoice).await;
                let mut fixes = 0;
                if job.options.auto_fix {
                    let outcome = deps.validator.auto_fix(&record.invoice, &result);
                    if !outcome.applied.is_empty() {
                        fixes = outcome.applied.len();
                        record.invoice = outcome.invoice;
                        deps.records.update_invoice(&record).await?;
                        deps.records
                            .replace_line_items(job.invoice_id, &record.invoice.line_items)
                            .await?;
                        result = deps.validator.validate(&record.invoice).await;
                    }
                }
                let detail = json!({
                    "score": result.score,
                    "valid": result.is_valid,
                    "findings": result.findings.len(),
                    "critical": result.critical_count(),
                    "fixes_applied": fixes,
                });
                Ok::<_, PipelineError>((detail, Some(result)))
            })
            .await?;

        let critical = validation.as_ref().map(|r| r.critical_count()).unwrap_or(0);
        self.step(job, token, deadline, Checkpoint::Generation, async {
            if critical > 0 {
                record.error_message = Some(PipelineError::ValidationCritical { count: critical }.to_string());
                record.status = match config.critical_outcome {
                    CriticalOutcome::Draft => InvoiceStatus::Draft,
                    CriticalOutcome::Failed => InvoiceStatus::Failed,
                };
                return Ok((json!({ "generated": false, "critical": critical }), ()));
            }

            let document = deps
                .generator
                .generate(&record.invoice)
                .map_err(|e| PipelineError::DocumentGenerationFailed(e.to_string()))?;
            let key = generated_document_key(job.owner_id, job.invoice_id);
            let url = deps
                .blobs
                .put(&key, document, deps.generator.content_type())
                .await
                .map_err(|e| PipelineError::UploadFailed(e.to_string()))?;

            record.generated_document_url = Some(url.clone());
            record.error_message = None;
            record.status = if config.auto_submit {
                InvoiceStatus::Submitted
            } else {
                InvoiceStatus::Draft
            };
            Ok::<_, PipelineError>((json!({ "generated": true, "url": url }), ()))
        })
        .await?;

        self.step(job, token, deadline, Checkpoint::Completion, async {
            record.processing_completed_at = Some(Utc::now());
            deps.records.update_invoice(&record).await?;
            Ok::<_, PipelineError>((json!({ "status": record.status }), ()))
        })
        .await
    }

    /// Run one checkpoint under the attempt's cancel token and deadline, then record it.
    async fn step<T, F>(
        &self,
        job: &Job,
        token: &CancelToken,
        deadline: Instant,
        checkpoint: Checkpoint,
        work: F,
    ) -> PipelineResult<T>
    where
        F: Future<Output = PipelineResult<(Value, T)>>,
    {
        let started = Instant::now();
        match guarded(token, deadline, self.inner.config.job_timeout_secs, work).await {
            Ok((mut detail, value)) => {
                self.inner.registry.update(job.id, |e| e.advance(checkpoint))?;
                if let Value::Object(map) = &mut detail {
                    map.insert("duration_ms".into(), json!(started.elapsed().as_millis() as u64));
                }
                debug!(checkpoint = %checkpoint, "checkpoint reached");
                self.log(job, checkpoint, "completed", detail).await;
                Ok(value)
            }
            Err(e) => {
                warn!(checkpoint = %checkpoint, error = %e, "checkpoint failed");
                self.log(job, checkpoint, "failed", json!({ "error": e.to_string() })).await;
                Err(e)
            }
        }
    }

    /// Processing logs are best-effort; a log write never fails the job.
    async fn log(&self, job: &Job, checkpoint: Checkpoint, status: &str, detail: Value) {
        let entry = ProcessingLogEntry::new(job.id, job.invoice_id, checkpoint.as_str(), status, detail);
        if let Err(e) = self.inner.deps.records.append_log(&entry).await {
            warn!(checkpoint = %checkpoint, error = %e, "could not write processing log");
        }
    }

    async fn handle_failure(&self, job: &Job, error: PipelineError) {
        let retry = self.inner.retry;
        let next = self.inner.registry.update(job.id, |entry| {
            if entry.state != JobState::Active {
                return Ok(None);
            }
            let attempt = entry.attempts_in_budget();
            if retry.should_retry(attempt, &error) {
                let delay = retry.delay_for(attempt);
                entry.transition(JobState::Queued)?;
                entry.error = Some(error.to_string());
                entry.next_attempt_at = chrono::Duration::from_std(delay).ok().map(|d| Utc::now() + d);
                return Ok(Some(Next::Retry(delay)));
            }

            let message = if error.is_retryable() {
                PipelineError::RetryExhausted {
                    attempts: attempt,
                    last_error: error.to_string(),
                }
                .to_string()
            } else {
                error.to_string()
            };
            entry.transition(JobState::Failed)?;
            entry.error = Some(message.clone());
            Ok(Some(Next::Fail(message)))
        });

        match next {
            Ok(Some(Next::Retry(delay))) => {
                metrics::JOBS_RETRIED.inc();
                info!(error = %error, delay_ms = delay.as_millis() as u64, "attempt failed, retry scheduled");
                let pipeline = self.clone();
                let (job_id, priority) = (job.id, job.options.priority);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if !pipeline.inner.queue.push(job_id, priority) {
                        pipeline.abandon(job_id, SHUTDOWN_MESSAGE).await;
                    }
                });
            }
            Ok(Some(Next::Fail(message))) => {
                self.inner.registry.release_token(job.id);
                metrics::JOBS_FAILED.inc();
                error!(error = %message, "job failed");
                self.mark_invoice_failed(job.invoice_id, &message).await;
            }
            Ok(None) => debug!(error = %error, "attempt failed after the job left the active state"),
            Err(e) => warn!(error = %e, "could not record job failure"),
        }
    }
}
