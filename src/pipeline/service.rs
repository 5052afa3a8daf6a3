use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::quota::{QuotaGate, QuotaUsage};
use super::queue::JobQueue;
use super::registry::JobRegistry;
use super::retry::RetryPolicy;
use crate::core::{PipelineConfig, PipelineError, PipelineResult, QuotaConfig};
use crate::extraction::ExtractionOrchestrator;
use crate::generators::DocumentGenerator;
use crate::metrics;
use crate::models::{
    Invoice, InvoiceRecord, InvoiceStatus, Job, JobState, JobStats, JobStatus, MediaType, SubmitReceipt, SubmitRequest,
};
use crate::storage::{BlobStore, RecordStore};
use crate::validation::ValidationEngine;

pub(super) const SHUTDOWN_MESSAGE: &str = "pipeline shut down before the job ran";

/// Collaborators a job attempt calls into.
#[derive(Clone)]
pub struct PipelineDeps {
    pub records: Arc<dyn RecordStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub extractor: Arc<ExtractionOrchestrator>,
    pub validator: Arc<ValidationEngine>,
    pub generator: Arc<dyn DocumentGenerator>,
}

pub(super) struct Inner {
    pub(super) deps: PipelineDeps,
    pub(super) config: PipelineConfig,
    pub(super) retry: RetryPolicy,
    pub(super) quota: QuotaGate,
    pub(super) queue: JobQueue,
    pub(super) registry: JobRegistry,
}

/// Job pipeline: admission, status, retry and cancellation. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    pub(super) inner: Arc<Inner>,
}

impl Pipeline {
    pub fn new(deps: PipelineDeps, config: PipelineConfig, quota: QuotaConfig) -> Self {
        let quota = QuotaGate::new(quota, deps.records.clone());
        Pipeline {
            inner: Arc::new(Inner {
                retry: RetryPolicy::from_config(&config),
                deps,
                config,
                quota,
                queue: JobQueue::new(),
                registry: JobRegistry::new(),
            }),
        }
    }

    pub fn deps(&self) -> &PipelineDeps {
        &self.inner.deps
    }

    /// Check media type, size and quota, then create the invoice record and enqueue the job.
    #[instrument(skip(self, request), fields(owner_id = %request.owner_id, file_name = %request.file_name))]
    pub async fn submit(&self, request: SubmitRequest) -> PipelineResult<SubmitReceipt> {
        if self.inner.queue.is_closed() {
            return Err(PipelineError::ShuttingDown);
        }
        let media = MediaType::from_mime(&request.mime_type)
            .or_else(|| MediaType::from_file_name(&request.file_name))
            .ok_or_else(|| PipelineError::UnsupportedMediaType(request.mime_type.clone()))?;

        let max = self.inner.config.max_file_bytes;
        if request.file_size > max {
            return Err(PipelineError::FileTooLarge {
                size: request.file_size,
                max,
            });
        }

        if let Err(e) = self.inner.quota.check(request.owner_id).await {
            if matches!(e, PipelineError::QuotaExceeded { .. }) {
                metrics::QUOTA_REJECTIONS.inc();
                info!(error = %e, "submission rejected");
            }
            return Err(e);
        }

        let invoice_id = Uuid::new_v4();
        let mut record = InvoiceRecord::new(Invoice::new(invoice_id, request.owner_id), InvoiceStatus::Processing);
        record.source_document_key = Some(request.file_key.clone());
        self.inner.deps.records.create_invoice(&record).await?;

        let job = Job {
            id: Uuid::new_v4(),
            invoice_id,
            owner_id: request.owner_id,
            file_key: request.file_key,
            file_name: request.file_name,
            mime_type: media.mime().to_string(),
            options: request.options,
            attempts_made: 0,
            created_at: Utc::now(),
        };
        let receipt = SubmitReceipt {
            job_id: job.id,
            invoice_id,
        };
        let priority = job.options.priority;
        self.inner.registry.insert(job);
        metrics::JOBS_SUBMITTED.inc();
        if !self.inner.queue.push(receipt.job_id, priority) {
            self.abandon(receipt.job_id, SHUTDOWN_MESSAGE).await;
            return Err(PipelineError::ShuttingDown);
        }

        info!(job_id = %receipt.job_id, invoice_id = %invoice_id, "job queued");
        Ok(receipt)
    }

    pub fn get_status(&self, job_id: Uuid) -> PipelineResult<JobStatus> {
        self.inner.registry.status(job_id)
    }

    /// Re-queue a failed job with a fresh attempt budget.
    #[instrument(skip(self))]
    pub async fn retry(&self, job_id: Uuid) -> PipelineResult<JobStatus> {
        if self.inner.queue.is_closed() {
            return Err(PipelineError::ShuttingDown);
        }
        let (status, priority) = self.inner.registry.update(job_id, |entry| {
            if entry.state != JobState::Failed {
                return Err(PipelineError::InvalidTransition(format!(
                    "job {} is {:?}; only failed jobs can be retried",
                    job_id, entry.state
                )));
            }
            entry.transition(JobState::Queued)?;
            entry.budget_start = entry.job.attempts_made;
            entry.error = None;
            entry.progress = 0;
            entry.checkpoint = None;
            Ok((entry.status(), entry.job.options.priority))
        })?;

        self.inner.registry.renew_token(job_id);
        if !self.inner.queue.push(job_id, priority) {
            self.abandon(job_id, SHUTDOWN_MESSAGE).await;
            return Err(PipelineError::ShuttingDown);
        }
        info!("job re-queued by request");
        Ok(status)
    }

    /// Terminally fail a queued or active job. An active attempt stops at its next suspension point.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: Uuid) -> PipelineResult<JobStatus> {
        let status = self.inner.registry.update(job_id, |entry| match entry.state {
            JobState::Queued | JobState::Active => {
                entry.transition(JobState::Failed)?;
                entry.error = Some("cancelled".to_string());
                entry.next_attempt_at = None;
                Ok(entry.status())
            }
            other => Err(PipelineError::InvalidTransition(format!(
                "job {} is already {:?}",
                job_id, other
            ))),
        })?;

        if let Some(token) = self.inner.registry.release_token(job_id) {
            token.cancel();
        }
        metrics::JOBS_FAILED.inc();
        self.mark_invoice_failed(status.invoice_id, "cancelled").await;
        info!("job cancelled");
        Ok(status)
    }

    pub fn stats(&self) -> JobStats {
        self.inner.registry.stats()
    }

    pub async fn quota_usage(&self, owner: Uuid) -> PipelineResult<QuotaUsage> {
        self.inner.quota.usage(owner, Utc::now()).await
    }

    /// Stop handing out jobs; in-flight attempts run to completion.
    /// Jobs still queued when the dispatcher stops are failed.
    pub fn shutdown(&self) {
        self.inner.queue.close();
    }

    /// Forget finished jobs past `job_retention_secs` or beyond `retained_jobs`.
    pub(super) fn evict_finished_jobs(&self) -> usize {
        let config = &self.inner.config;
        let removed = self.inner.registry.evict_terminal(
            Duration::from_secs(config.job_retention_secs),
            config.retained_jobs,
            Utc::now(),
        );
        if removed > 0 {
            debug!(removed, "finished jobs evicted");
        }
        removed
    }

    /// Fail a job that is still queued and will never be dispatched.
    pub(super) async fn abandon(&self, job_id: Uuid, reason: &str) {
        let abandoned = self.inner.registry.update(job_id, |entry| {
            if entry.state != JobState::Queued {
                return Ok(None);
            }
            entry.transition(JobState::Failed)?;
            entry.error = Some(reason.to_string());
            entry.next_attempt_at = None;
            Ok(Some(entry.job.invoice_id))
        });
        match abandoned {
            Ok(Some(invoice_id)) => {
                self.inner.registry.release_token(job_id);
                metrics::JOBS_FAILED.inc();
                warn!(job_id = %job_id, reason, "queued job abandoned");
                self.mark_invoice_failed(invoice_id, reason).await;
            }
            Ok(None) => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "could not abandon job"),
        }
    }

    pub(super) async fn mark_invoice_failed(&self, invoice_id: Uuid, message: &str) {
        let records = &self.inner.deps.records;
        let outcome = async {
            let mut record = records.get_invoice(invoice_id).await?;
            record.status = InvoiceStatus::Failed;
            record.error_message = Some(message.to_string());
            record.processing_completed_at = Some(Utc::now());
            records.update_invoice(&record).await
        }
        .await;
        if let Err(e) = outcome {
            warn!(invoice_id = %invoice_id, error = %e, "could not mark invoice failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LruCache;
    use crate::core::{CriticalOutcome, StorageError, StorageResult, ValidationConfig};
    use crate::extraction::{Enhancer, OrchestratorConfig};
    use crate::generators::UblGenerator;
    use crate::jurisdiction::GstRateTable;
    use crate::models::{Checkpoint, JobOptions};
    use crate::providers::spreadsheet::SpreadsheetProvider;
    use crate::storage::{generated_document_key, source_document_key, MemoryBlobStore, MemoryRecordStore};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use rust_decimal::Decimal;
    use rust_xlsxwriter::Workbook;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::sync::Semaphore;

    const XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

    /// Fails the first `failures` downloads with a transient backend error.
    struct FlakyBlobs {
        inner: MemoryBlobStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl BlobStore for FlakyBlobs {
        async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> StorageResult<String> {
            self.inner.put(key, bytes, content_type).await
        }

        async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StorageError::Backend("connection reset by peer".into()));
            }
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> StorageResult<()> {
            self.inner.delete(key).await
        }
    }

    /// Holds every download until the gate hands out a permit, recording start times
    /// and how many downloads were in flight at once.
    struct GatedBlobs {
        inner: MemoryBlobStore,
        gate: Semaphore,
        active: AtomicUsize,
        peak: AtomicUsize,
        starts: Mutex<Vec<Instant>>,
    }

    impl GatedBlobs {
        fn new(open: usize) -> Arc<Self> {
            Arc::new(GatedBlobs {
                inner: MemoryBlobStore::new(),
                gate: Semaphore::new(open),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                starts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl BlobStore for GatedBlobs {
        async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> StorageResult<String> {
            self.inner.put(key, bytes, content_type).await
        }

        async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
            self.starts.lock().push(Instant::now());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let permit = self.gate.acquire().await.map_err(|e| StorageError::Backend(e.to_string()))?;
            permit.forget();
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> StorageResult<()> {
            self.inner.delete(key).await
        }
    }

    struct Harness {
        pipeline: Pipeline,
        records: Arc<MemoryRecordStore>,
        blobs: Arc<FlakyBlobs>,
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            workers: 2,
            jobs_per_second: 100,
            backoff_base_ms: 10,
            job_timeout_secs: 10,
            ..PipelineConfig::default()
        }
    }

    fn harness(config: PipelineConfig, download_failures: u32) -> Harness {
        let records = Arc::new(MemoryRecordStore::new());
        let blobs = Arc::new(FlakyBlobs {
            inner: MemoryBlobStore::new(),
            failures: AtomicU32::new(download_failures),
        });
        Harness {
            pipeline: pipeline_over(config, records.clone(), blobs.clone()),
            records,
            blobs,
        }
    }

    fn pipeline_over(config: PipelineConfig, records: Arc<MemoryRecordStore>, blobs: Arc<dyn BlobStore>) -> Pipeline {
        let rates = GstRateTable::default();
        let extractor = ExtractionOrchestrator::new(
            vec![Arc::new(SpreadsheetProvider::new(rates.clone()))],
            None,
            Enhancer::new(rates.clone(), None, 0.8),
            Arc::new(LruCache::new(16)),
            OrchestratorConfig::default(),
        );
        let deps = PipelineDeps {
            records: records.clone(),
            blobs,
            extractor: Arc::new(extractor),
            validator: Arc::new(ValidationEngine::new(rates.clone(), ValidationConfig::default(), Some(records))),
            generator: Arc::new(UblGenerator::new(rates).unwrap()),
        };
        Pipeline::new(deps, config, QuotaConfig::default())
    }

    fn workbook(with_gst_number: bool) -> Vec<u8> {
        let date = (Utc::now().date_naive() - chrono::Duration::days(3)).format("%Y-%m-%d").to_string();
        let mut rows: Vec<Vec<String>> = vec![
            vec!["Supplier".into(), "Acme Pte Ltd".into()],
            vec!["UEN".into(), "201912345A".into()],
        ];
        if with_gst_number {
            rows.push(vec!["GST Reg No".into(), "M212345678".into()]);
        }
        rows.extend([
            vec!["Invoice No".into(), format!("INV-{}", Uuid::new_v4().simple())],
            vec!["Date".into(), date],
            vec!["Bill To".into(), "Globex Pte Ltd".into()],
            vec!["Currency".into(), "SGD".into()],
            vec![],
            vec!["Description".into(), "Qty".into(), "Unit Price".into(), "Tax Code".into(), "Amount".into()],
            vec!["Consulting".into(), "10".into(), "100".into(), "SR".into(), "1000".into()],
        ]);

        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        for (r, row) in rows.iter().enumerate() {
            for (c, cell) in row.iter().enumerate() {
                sheet.write_string(r as u32, c as u16, cell.as_str()).unwrap();
            }
        }
        workbook.save_to_buffer().unwrap()
    }

    async fn upload(h: &Harness, owner: Uuid, bytes: Vec<u8>) -> SubmitRequest {
        upload_to(&h.blobs.inner, owner, bytes).await
    }

    async fn upload_to(store: &MemoryBlobStore, owner: Uuid, bytes: Vec<u8>) -> SubmitRequest {
        let key = format!("uploads/{}/invoice.xlsx", Uuid::new_v4());
        let size = bytes.len() as u64;
        store.put(&key, bytes, XLSX).await.unwrap();
        SubmitRequest {
            owner_id: owner,
            file_key: key,
            file_name: "invoice.xlsx".into(),
            mime_type: XLSX.into(),
            file_size: size,
            options: JobOptions::default(),
        }
    }

    async fn wait_for(pipeline: &Pipeline, job_id: Uuid, state: JobState) -> JobStatus {
        for _ in 0..500 {
            let status = pipeline.get_status(job_id).unwrap();
            if status.state == state {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {:?}: {:?}", job_id, state, pipeline.get_status(job_id));
    }

    #[tokio::test]
    async fn test_spreadsheet_job_runs_every_checkpoint() {
        let h = harness(config(), 0);
        let worker = h.pipeline.start();
        let request = upload(&h, Uuid::new_v4(), workbook(true)).await;

        let receipt = h.pipeline.submit(request).await.unwrap();
        let status = wait_for(&h.pipeline, receipt.job_id, JobState::Completed).await;

        assert_eq!(status.progress, 100);
        assert_eq!(status.attempts_made, 1);

        let record = h.records.get_invoice(receipt.invoice_id).await.unwrap();
        assert_eq!(record.status, InvoiceStatus::Draft);
        assert_eq!(record.invoice.subtotal, Some(Decimal::from(1000)));
        assert_eq!(record.invoice.tax_amount, Some(Decimal::from(90)));
        assert_eq!(record.invoice.total_amount, Some(Decimal::from(1090)));
        assert_eq!(h.records.line_items(receipt.invoice_id).len(), 1);
        assert!(record.processing_completed_at.is_some());

        let source = source_document_key(record.owner_id(), record.id(), "invoice.xlsx");
        assert_eq!(record.source_document_key.as_deref(), Some(source.as_str()));
        assert_eq!(h.blobs.inner.content_type(&source).as_deref(), Some(XLSX));

        let key = generated_document_key(record.owner_id(), record.id());
        assert_eq!(record.generated_document_url, Some(format!("memory://{}", key)));
        let xml = String::from_utf8(h.blobs.get(&key).await.unwrap()).unwrap();
        assert!(xml.contains("<cbc:PayableAmount currencyID=\"SGD\">1090.00</cbc:PayableAmount>"));

        let actions: Vec<(String, String)> = h
            .records
            .logs_for(receipt.job_id)
            .into_iter()
            .map(|e| (e.action, e.status))
            .collect();
        let expected: Vec<(String, String)> = Checkpoint::ALL
            .iter()
            .map(|c| (c.as_str().to_string(), "completed".to_string()))
            .collect();
        assert_eq!(actions, expected);

        h.pipeline.shutdown();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_then_success_completes_on_second_attempt() {
        let h = harness(config(), 1);
        let _worker = h.pipeline.start();
        let request = upload(&h, Uuid::new_v4(), workbook(true)).await;

        let receipt = h.pipeline.submit(request).await.unwrap();
        let status = wait_for(&h.pipeline, receipt.job_id, JobState::Completed).await;

        assert_eq!(status.attempts_made, 2);
        let logs = h.records.logs_for(receipt.job_id);
        assert_eq!(logs[0].action, "download");
        assert_eq!(logs[0].status, "failed");
        assert_eq!(logs.last().map(|e| e.action.as_str()), Some("completion"));
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_job_and_invoice() {
        let h = harness(config(), u32::MAX);
        let _worker = h.pipeline.start();
        let request = upload(&h, Uuid::new_v4(), workbook(true)).await;

        let receipt = h.pipeline.submit(request).await.unwrap();
        let status = wait_for(&h.pipeline, receipt.job_id, JobState::Failed).await;

        assert_eq!(status.attempts_made, 3);
        let error = status.error.unwrap();
        assert!(error.contains("giving up after 3 attempt(s)"), "{}", error);
        assert!(error.contains("connection reset by peer"));

        let record = h.records.get_invoice(receipt.invoice_id).await.unwrap();
        assert_eq!(record.status, InvoiceStatus::Failed);
        assert!(record.generated_document_url.is_none());
        let failed_downloads = h
            .records
            .logs_for(receipt.job_id)
            .iter()
            .filter(|e| e.action == "download" && e.status == "failed")
            .count();
        assert_eq!(failed_downloads, 3);
        assert!(h.pipeline.inner.registry.token(receipt.job_id).is_err());

        let retried = h.pipeline.retry(receipt.job_id).await.unwrap();
        assert_eq!(retried.state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_critical_findings_skip_generation() {
        for (outcome, expected) in [
            (CriticalOutcome::Draft, InvoiceStatus::Draft),
            (CriticalOutcome::Failed, InvoiceStatus::Failed),
        ] {
            let h = harness(
                PipelineConfig {
                    critical_outcome: outcome,
                    ..config()
                },
                0,
            );
            let _worker = h.pipeline.start();
            let request = upload(&h, Uuid::new_v4(), workbook(false)).await;

            let receipt = h.pipeline.submit(request).await.unwrap();
            wait_for(&h.pipeline, receipt.job_id, JobState::Completed).await;

            let record = h.records.get_invoice(receipt.invoice_id).await.unwrap();
            assert_eq!(record.status, expected);
            assert!(record.generated_document_url.is_none());
            assert!(record.error_message.unwrap().contains("critical"));
        }
    }

    #[tokio::test]
    async fn test_auto_submit_marks_invoice_submitted() {
        let h = harness(
            PipelineConfig {
                auto_submit: true,
                ..config()
            },
            0,
        );
        let _worker = h.pipeline.start();
        let request = upload(&h, Uuid::new_v4(), workbook(true)).await;

        let receipt = h.pipeline.submit(request).await.unwrap();
        wait_for(&h.pipeline, receipt.job_id, JobState::Completed).await;

        let record = h.records.get_invoice(receipt.invoice_id).await.unwrap();
        assert_eq!(record.status, InvoiceStatus::Submitted);
    }

    #[tokio::test]
    async fn test_quota_exceeded_rejects_before_enqueue() {
        let h = harness(config(), 0);
        let owner = Uuid::new_v4();
        h.records.set_plan(owner, "free");
        for _ in 0..50 {
            let record = InvoiceRecord::new(Invoice::new(Uuid::new_v4(), owner), InvoiceStatus::Draft);
            h.records.create_invoice(&record).await.unwrap();
        }
        let request = upload(&h, owner, workbook(true)).await;

        let err = h.pipeline.submit(request).await.unwrap_err();

        assert!(matches!(err, PipelineError::QuotaExceeded { usage: 50, limit: 50 }));
        assert_eq!(err.to_string(), "quota exceeded: 50/50 invoices this billing period");
        assert_eq!(h.pipeline.stats(), JobStats::default());
        let usage = h.pipeline.quota_usage(owner).await.unwrap();
        assert_eq!(usage.usage, 50);
    }

    #[tokio::test]
    async fn test_submit_rejects_unsupported_and_oversized_files() {
        let h = harness(config(), 0);
        let mut request = upload(&h, Uuid::new_v4(), workbook(true)).await;
        request.mime_type = "text/plain".into();
        request.file_name = "notes.txt".into();
        assert!(matches!(
            h.pipeline.submit(request.clone()).await,
            Err(PipelineError::UnsupportedMediaType(_))
        ));

        request.mime_type = XLSX.into();
        request.file_size = 10 * 1024 * 1024 + 1;
        assert!(matches!(
            h.pipeline.submit(request).await,
            Err(PipelineError::FileTooLarge { .. })
        ));
        assert_eq!(h.pipeline.stats(), JobStats::default());
    }

    #[tokio::test]
    async fn test_cancel_queued_job_then_retry() {
        let h = harness(config(), 0);
        let request = upload(&h, Uuid::new_v4(), workbook(true)).await;
        let receipt = h.pipeline.submit(request).await.unwrap();

        let cancelled = h.pipeline.cancel(receipt.job_id).await.unwrap();

        assert_eq!(cancelled.state, JobState::Failed);
        assert_eq!(cancelled.error.as_deref(), Some("cancelled"));
        let record = h.records.get_invoice(receipt.invoice_id).await.unwrap();
        assert_eq!(record.status, InvoiceStatus::Failed);
        assert!(matches!(
            h.pipeline.cancel(receipt.job_id).await,
            Err(PipelineError::InvalidTransition(_))
        ));

        h.pipeline.retry(receipt.job_id).await.unwrap();
        assert_eq!(
            h.pipeline.stats(),
            JobStats {
                queued: 1,
                ..JobStats::default()
            }
        );
    }

    #[tokio::test]
    async fn test_retry_only_from_failed() {
        let h = harness(config(), 0);
        let request = upload(&h, Uuid::new_v4(), workbook(true)).await;
        let receipt = h.pipeline.submit(request).await.unwrap();

        assert!(matches!(
            h.pipeline.retry(receipt.job_id).await,
            Err(PipelineError::InvalidTransition(_))
        ));
        assert!(matches!(
            h.pipeline.get_status(Uuid::new_v4()),
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_finished_jobs_release_tokens_and_are_evicted() {
        let h = harness(
            PipelineConfig {
                retained_jobs: 0,
                ..config()
            },
            0,
        );
        let worker = h.pipeline.start();
        let request = upload(&h, Uuid::new_v4(), workbook(true)).await;
        let receipt = h.pipeline.submit(request).await.unwrap();
        wait_for(&h.pipeline, receipt.job_id, JobState::Completed).await;

        assert!(matches!(
            h.pipeline.inner.registry.token(receipt.job_id),
            Err(PipelineError::NotFound(_))
        ));
        assert_eq!(h.pipeline.evict_finished_jobs(), 1);
        assert!(matches!(
            h.pipeline.get_status(receipt.job_id),
            Err(PipelineError::NotFound(_))
        ));
        assert_eq!(h.pipeline.stats(), JobStats::default());
        let record = h.records.get_invoice(receipt.invoice_id).await.unwrap();
        assert_eq!(record.status, InvoiceStatus::Draft);

        h.pipeline.shutdown();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_fails_jobs_waiting_on_a_retry() {
        let h = harness(
            PipelineConfig {
                backoff_base_ms: 5_000,
                ..config()
            },
            u32::MAX,
        );
        let worker = h.pipeline.start();
        let request = upload(&h, Uuid::new_v4(), workbook(true)).await;
        let receipt = h.pipeline.submit(request).await.unwrap();

        let mut waiting = false;
        for _ in 0..500 {
            let status = h.pipeline.get_status(receipt.job_id).unwrap();
            if status.state == JobState::Queued && status.attempts_made == 1 {
                waiting = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(waiting, "first attempt never scheduled a retry");

        h.pipeline.shutdown();
        worker.await.unwrap();

        let status = h.pipeline.get_status(receipt.job_id).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.error.as_deref(), Some(SHUTDOWN_MESSAGE));
        assert!(status.next_attempt_at.is_none());
        let record = h.records.get_invoice(receipt.invoice_id).await.unwrap();
        assert_eq!(record.status, InvoiceStatus::Failed);

        let request = upload(&h, Uuid::new_v4(), workbook(true)).await;
        assert!(matches!(h.pipeline.submit(request).await, Err(PipelineError::ShuttingDown)));
        assert!(matches!(h.pipeline.retry(receipt.job_id).await, Err(PipelineError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_document_no_source_accepts_fails_without_retry() {
        let h = harness(config(), 0);
        let _worker = h.pipeline.start();
        let key = format!("uploads/{}/scan.pdf", Uuid::new_v4());
        h.blobs.inner.put(&key, b"%PDF-1.4".to_vec(), "application/pdf").await.unwrap();
        let request = SubmitRequest {
            owner_id: Uuid::new_v4(),
            file_key: key,
            file_name: "scan.pdf".into(),
            mime_type: "application/pdf".into(),
            file_size: 8,
            options: JobOptions::default(),
        };

        let receipt = h.pipeline.submit(request).await.unwrap();
        let status = wait_for(&h.pipeline, receipt.job_id, JobState::Failed).await;

        assert_eq!(status.attempts_made, 1);
        let error = status.error.unwrap();
        assert!(error.contains("no configured extraction source accepts"), "{}", error);
        assert!(!error.contains("giving up"));
    }

    #[tokio::test]
    async fn test_worker_pool_caps_concurrent_attempts() {
        let blobs = GatedBlobs::new(0);
        let pipeline = pipeline_over(config(), Arc::new(MemoryRecordStore::new()), blobs.clone());
        let worker = pipeline.start();
        let mut jobs = Vec::new();
        for _ in 0..5 {
            let request = upload_to(&blobs.inner, Uuid::new_v4(), workbook(true)).await;
            jobs.push(pipeline.submit(request).await.unwrap().job_id);
        }

        for _ in 0..500 {
            if blobs.active.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(blobs.peak.load(Ordering::SeqCst), 2);
        assert_eq!(
            pipeline.stats(),
            JobStats {
                queued: 3,
                active: 2,
                ..JobStats::default()
            }
        );

        blobs.gate.add_permits(jobs.len());
        for job_id in jobs {
            wait_for(&pipeline, job_id, JobState::Completed).await;
        }
        assert_eq!(blobs.peak.load(Ordering::SeqCst), 2);

        pipeline.shutdown();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limiter_spaces_job_starts() {
        let blobs = GatedBlobs::new(16);
        let pipeline = pipeline_over(
            PipelineConfig {
                workers: 4,
                jobs_per_second: 1,
                ..config()
            },
            Arc::new(MemoryRecordStore::new()),
            blobs.clone(),
        );
        let worker = pipeline.start();
        let mut jobs = Vec::new();
        for _ in 0..3 {
            let request = upload_to(&blobs.inner, Uuid::new_v4(), workbook(true)).await;
            jobs.push(pipeline.submit(request).await.unwrap().job_id);
        }
        for job_id in jobs {
            wait_for(&pipeline, job_id, JobState::Completed).await;
        }

        let mut starts = blobs.starts.lock().clone();
        starts.sort();
        assert_eq!(starts.len(), 3);
        assert!(starts[1] - starts[0] >= Duration::from_millis(900), "{:?}", starts[1] - starts[0]);
        assert!(starts[2] - starts[0] >= Duration::from_millis(1800), "{:?}", starts[2] - starts[0]);

        pipeline.shutdown();
        worker.await.unwrap();
    }
}
