use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::enhance::Enhancer;
use super::merge::{merge_results, MergeConfig};
use super::scoring::consensus_confidence;
use super::text::document_text;
use crate::cache::Cache;
use crate::core::{ExtractionConfig, ExtractionError, ProviderFailure};
use crate::metrics;
use crate::models::{ExtractionOptions, ExtractionResult, MediaType};
use crate::providers::ExtractionProvider;
use crate::templates::TemplateMatcher;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub template_matching: bool,
    pub template_threshold: f64,
    pub provider_threshold: f64,
    pub early_return_threshold: f64,
    pub merge: MergeConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig::from(&ExtractionConfig::default())
    }
}

impl From<&ExtractionConfig> for OrchestratorConfig {
    fn from(config: &ExtractionConfig) -> Self {
        OrchestratorConfig {
            template_matching: config.template_matching,
            template_threshold: config.template_threshold,
            provider_threshold: config.provider_threshold,
            early_return_threshold: config.early_return_threshold,
            merge: MergeConfig {
                name_similarity_threshold: config.name_similarity_threshold,
                line_item_min_confidence: config.merge_line_item_min_confidence,
            },
        }
    }
}

/// Coordinates the template fast path and the provider adapters into one scored result.
pub struct ExtractionOrchestrator {
    providers: Vec<Arc<dyn ExtractionProvider>>,
    templates: Option<Arc<TemplateMatcher>>,
    enhancer: Enhancer,
    cache: Arc<dyn Cache<ExtractionResult>>,
    config: OrchestratorConfig,
}

/// Attempt log for one extraction request.
#[derive(Default)]
struct Attempts {
    results: Vec<ExtractionResult>,
    failures: Vec<ProviderFailure>,
}

impl ExtractionOrchestrator {
    pub fn new(
        providers: Vec<Arc<dyn ExtractionProvider>>,
        templates: Option<Arc<TemplateMatcher>>,
        enhancer: Enhancer,
        cache: Arc<dyn Cache<ExtractionResult>>,
        config: OrchestratorConfig,
    ) -> Self {
        ExtractionOrchestrator {
            providers,
            templates,
            enhancer,
            cache,
            config,
        }
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.id().to_string()).collect()
    }

    #[instrument(skip(self, bytes, options), fields(size = bytes.len()))]
    pub async fn extract(
        &self,
        bytes: &[u8],
        file_name: &str,
        options: &ExtractionOptions,
    ) -> Result<ExtractionResult, ExtractionError> {
        let started = Instant::now();
        let fingerprint = hex::encode(Sha256::digest(bytes));

        if let Some(cached) = self.cache.get(&fingerprint).await {
            debug!(fingerprint = %fingerprint, "extraction cache hit");
            return Ok(cached);
        }

        let media = options.media_type.or_else(|| MediaType::from_file_name(file_name));
        let Some(media) = media else {
            return Err(ExtractionError::NoEligibleProvider(format!("{} (unknown media type)", file_name)));
        };

        let mut attempts = Attempts::default();

        if options.use_templates.unwrap_or(self.config.template_matching) {
            if let Some(result) = self.try_templates(bytes, media).await {
                if result.confidence >= self.config.template_threshold {
                    info!(source = %result.source, confidence = result.confidence, "template fast path");
                    attempts.results.push(result.clone());
                    return Ok(self.finish(result, &attempts, &fingerprint, options, started).await);
                }
                attempts.results.push(result);
            }
        }

        let preferred = options
            .preferred_provider
            .as_deref()
            .and_then(|name| self.providers.iter().find(|p| p.id() == name));

        if let Some(provider) = preferred {
            let threshold = options.confidence_threshold.unwrap_or(self.config.provider_threshold);
            if let Some(result) = self.call(provider.as_ref(), bytes, file_name, media, &mut attempts).await {
                if result.confidence >= threshold {
                    info!(provider = provider.id(), confidence = result.confidence, "preferred provider accepted");
                    return Ok(self.finish(result, &attempts, &fingerprint, options, started).await);
                }
            }
        }

        for provider in &self.providers {
            if preferred.map(|p| p.id() == provider.id()).unwrap_or(false) {
                continue;
            }
            if let Some(result) = self.call(provider.as_ref(), bytes, file_name, media, &mut attempts).await {
                if result.confidence >= self.config.early_return_threshold {
                    info!(provider = provider.id(), confidence = result.confidence, "early return");
                    return Ok(self.finish(result, &attempts, &fingerprint, options, started).await);
                }
            }
        }

        let Some(merged) = merge_results(&attempts.results, self.config.merge) else {
            warn!(failures = attempts.failures.len(), "no extraction source produced a result");
            if attempts.failures.is_empty() {
                return Err(ExtractionError::NoEligibleProvider(media.to_string()));
            }
            return Err(ExtractionError::AllProvidersFailed(attempts.failures));
        };

        Ok(self.finish(merged, &attempts, &fingerprint, options, started).await)
    }

    async fn try_templates(&self, bytes: &[u8], media: MediaType) -> Option<ExtractionResult> {
        let matcher = self.templates.as_ref()?;
        if matcher.len().await == 0 {
            return None;
        }

        let started = Instant::now();
        let owned = bytes.to_vec();
        let text = tokio::task::spawn_blocking(move || document_text(&owned, media))
            .await
            .ok()
            .flatten()?;

        matcher.match_text(&text).await.map(|m| m.into_result(started))
    }

    /// Call one provider, recording the outcome. Unsupported or unconfigured providers are skipped.
    async fn call(
        &self,
        provider: &dyn ExtractionProvider,
        bytes: &[u8],
        file_name: &str,
        media: MediaType,
        attempts: &mut Attempts,
    ) -> Option<ExtractionResult> {
        let id = provider.id();
        if !provider.supports(media) {
            debug!(provider = id, media = %media, "provider skipped: unsupported media");
            return None;
        }
        if !provider.is_available().await {
            debug!(provider = id, "provider skipped: not available");
            return None;
        }

        let started = Instant::now();
        match provider.extract(bytes, file_name, media).await {
            Ok(fields) => {
                metrics::provider_call(id, "success");
                let confidence = provider.confidence(&fields);
                let result = ExtractionResult::new(fields, confidence, id, started.elapsed());
                debug!(provider = id, confidence, "provider result");
                attempts.results.push(result.clone());
                Some(result)
            }
            Err(e) => {
                metrics::provider_call(id, "error");
                warn!(provider = id, error = %e, "provider failed");
                attempts.failures.push(ProviderFailure::new(id, &e));
                None
            }
        }
    }

    async fn finish(
        &self,
        result: ExtractionResult,
        attempts: &Attempts,
        fingerprint: &str,
        options: &ExtractionOptions,
        started: Instant,
    ) -> ExtractionResult {
        let mut enhanced = self.enhancer.enhance(result, options.owner_id).await;
        enhanced.confidence = consensus_confidence(
            &enhanced.fields,
            &attempts.results,
            self.config.merge.name_similarity_threshold,
        );
        enhanced.duration_ms = started.elapsed().as_millis() as u64;

        metrics::EXTRACTION_SECONDS.observe(started.elapsed().as_secs_f64());
        self.cache.put(fingerprint, enhanced.clone()).await;
        enhanced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LruCache;
    use crate::core::ProviderError;
    use crate::jurisdiction::GstRateTable;
    use crate::models::{cent, ExtractedFields, FieldPattern, LineItem, Template, TemplateField};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_xlsxwriter::Workbook;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider returning fixed fields and counting its calls.
    struct FakeProvider {
        id: &'static str,
        fields: Option<ExtractedFields>,
        media: Option<MediaType>,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new(id: &'static str, fields: Option<ExtractedFields>) -> Arc<Self> {
            Arc::new(FakeProvider {
                id,
                fields,
                media: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn only(id: &'static str, media: MediaType, fields: ExtractedFields) -> Arc<Self> {
            Arc::new(FakeProvider {
                id,
                fields: Some(fields),
                media: Some(media),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExtractionProvider for FakeProvider {
        fn id(&self) -> &str {
            self.id
        }

        fn supports(&self, media: MediaType) -> bool {
            self.media.map(|only| only == media).unwrap_or(true)
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn extract(&self, _: &[u8], _: &str, _: MediaType) -> Result<ExtractedFields, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.fields
                .clone()
                .ok_or_else(|| ProviderError::unavailable(self.id, "connection refused"))
        }
    }

    fn complete(number: &str, customer: &str, total: i64) -> ExtractedFields {
        let mut fields = ExtractedFields {
            invoice_number: Some(number.into()),
            invoice_date: chrono::NaiveDate::from_ymd_opt(2024, 5, 1),
            total_amount: Some(Decimal::from(total)),
            ..Default::default()
        };
        fields.customer.name = Some(customer.into());
        fields
    }

    /// Every scored field present, balanced line items.
    fn thorough(number: &str) -> ExtractedFields {
        let mut fields = ExtractedFields {
            invoice_number: Some(number.into()),
            invoice_date: chrono::NaiveDate::from_ymd_opt(2024, 5, 1),
            total_amount: Some(Decimal::from(1090)),
            subtotal: Some(Decimal::from(1000)),
            tax_amount: Some(Decimal::from(90)),
            line_items: vec![LineItem::new("Consulting", Decimal::from(10), Decimal::from(100))],
            ..Default::default()
        };
        fields.customer.name = Some("Globex Pte Ltd".into());
        fields.vendor.name = Some("Acme Pte Ltd".into());
        fields.vendor.uen = Some("201912345A".into());
        fields
    }

    fn orchestrator(providers: Vec<Arc<dyn ExtractionProvider>>, templates: Option<Arc<TemplateMatcher>>) -> ExtractionOrchestrator {
        ExtractionOrchestrator::new(
            providers,
            templates,
            Enhancer::new(GstRateTable::default(), None, 0.8),
            Arc::new(LruCache::new(100)),
            OrchestratorConfig::default(),
        )
    }

    fn labelled_sheet() -> Vec<u8> {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        let rows = [
            ("UEN:", "201912345A"),
            ("Invoice No:", "INV-3001"),
            ("Total", "1,090.00"),
        ];
        for (i, (label, value)) in rows.iter().enumerate() {
            sheet.write_string(i as u32, 0, *label).unwrap();
            sheet.write_string(i as u32, 1, *value).unwrap();
        }
        workbook.save_to_buffer().unwrap()
    }

    #[tokio::test]
    async fn test_confident_template_match_skips_every_provider() {
        let matcher = Arc::new(TemplateMatcher::new(None, 50));
        matcher
            .add(Template::new(
                "acme",
                Some("201912345A".into()),
                vec![
                    FieldPattern {
                        field: TemplateField::InvoiceNumber,
                        pattern: r"Invoice No:\s*(\S+)".into(),
                    },
                    FieldPattern {
                        field: TemplateField::TotalAmount,
                        pattern: r"Total\s*([0-9,.]+)".into(),
                    },
                ],
                0.9,
            ))
            .await
            .unwrap();
        let remote = FakeProvider::new("document_intelligence", Some(complete("X", "Y", 1)));
        let orch = orchestrator(vec![remote.clone()], Some(matcher));

        let result = orch
            .extract(&labelled_sheet(), "acme.xlsx", &ExtractionOptions::default())
            .await
            .unwrap();

        assert_eq!(remote.calls(), 0);
        assert!(result.source.starts_with("template:"));
        assert_eq!(result.fields.invoice_number.as_deref(), Some("INV-3001"));
    }

    #[tokio::test]
    async fn test_results_leave_reconciled() {
        let mut partial = complete("INV-1", "Globex", 1100);
        partial.subtotal = Some(Decimal::from(1000));
        partial.tax_amount = Some(Decimal::from(90));
        let orch = orchestrator(vec![FakeProvider::new("a", Some(partial))], None);

        let result = orch.extract(b"%PDF-1.4", "a.pdf", &ExtractionOptions::default()).await.unwrap();

        let f = &result.fields;
        let drift = (f.subtotal.unwrap() + f.tax_amount.unwrap() - f.total_amount.unwrap()).abs();
        assert!(drift <= cent());
    }

    #[tokio::test]
    async fn test_cache_hit_makes_no_provider_calls() {
        let provider = FakeProvider::new("a", Some(complete("INV-1", "Globex", 109)));
        let orch = orchestrator(vec![provider.clone()], None);
        let options = ExtractionOptions::default();

        let first = orch.extract(b"same bytes", "a.pdf", &options).await.unwrap();
        let second = orch.extract(b"same bytes", "a.pdf", &options).await.unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_preferred_provider_short_circuits() {
        let primary = FakeProvider::new("document_intelligence", Some(complete("INV-1", "Globex", 109)));
        let vision = FakeProvider::new("openai_vision", Some(complete("INV-1", "Globex", 109)));
        let orch = orchestrator(vec![primary.clone(), vision.clone()], None);
        let options = ExtractionOptions {
            preferred_provider: Some("openai_vision".into()),
            confidence_threshold: Some(0.5),
            ..Default::default()
        };

        let result = orch.extract(b"img", "a.png", &options).await.unwrap();

        assert_eq!(result.source, "openai_vision");
        assert_eq!(vision.calls(), 1);
        assert_eq!(primary.calls(), 0);
    }

    #[tokio::test]
    async fn test_low_confidence_results_are_merged() {
        let a = FakeProvider::new("a", Some(complete("INV-001", "Globex", 109)));
        let mut weaker = ExtractedFields::default();
        weaker.invoice_number = Some("INV-002".into());
        let b = FakeProvider::new("b", Some(weaker));
        let orch = orchestrator(vec![a.clone(), b.clone()], None);

        let result = orch.extract(b"doc", "a.pdf", &ExtractionOptions::default()).await.unwrap();

        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
        assert_eq!(result.source, "merged(a+b)");
        assert_eq!(result.fields.invoice_number.as_deref(), Some("INV-001"));
        assert!(result.warnings.iter().any(|w| w.contains("INV-002")));
    }

    #[tokio::test]
    async fn test_failures_are_tolerated_until_all_fail() {
        let down = FakeProvider::new("down", None);
        let up = FakeProvider::new("up", Some(complete("INV-1", "Globex", 109)));
        let orch = orchestrator(vec![down.clone(), up], None);
        assert!(orch.extract(b"doc", "a.pdf", &ExtractionOptions::default()).await.is_ok());

        let orch = orchestrator(vec![down, FakeProvider::new("also_down", None)], None);
        let err = orch.extract(b"doc2", "a.pdf", &ExtractionOptions::default()).await.unwrap_err();
        let causes = match err {
            ExtractionError::AllProvidersFailed(causes) => causes,
            other => panic!("expected provider failures, got {other:?}"),
        };
        assert_eq!(causes.len(), 2);
        assert!(causes.iter().all(|c| c.unavailable));
    }

    #[tokio::test]
    async fn test_confident_provider_stops_the_priority_loop() {
        let mut sparse = ExtractedFields::default();
        sparse.invoice_number = Some("INV-7".into());
        let first = FakeProvider::new("document_intelligence", Some(sparse));
        let second = FakeProvider::new("openai_vision", Some(thorough("INV-7")));
        let third = FakeProvider::new("spreadsheet", Some(thorough("INV-8")));
        let orch = orchestrator(vec![first.clone(), second.clone(), third.clone()], None);

        let result = orch.extract(b"scan", "a.pdf", &ExtractionOptions::default()).await.unwrap();

        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 1);
        assert_eq!(third.calls(), 0);
        assert_eq!(result.source, "openai_vision");
        assert_eq!(result.fields.invoice_number.as_deref(), Some("INV-7"));
    }

    #[tokio::test]
    async fn test_no_source_for_the_media_type() {
        let sheets = FakeProvider::only("spreadsheet", MediaType::Xlsx, thorough("INV-1"));
        let orch = orchestrator(vec![sheets.clone()], None);

        let err = orch.extract(b"%PDF-1.4", "a.pdf", &ExtractionOptions::default()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::NoEligibleProvider(_)));
        assert_eq!(sheets.calls(), 0);

        let err = orch.extract(b"notes", "notes.txt", &ExtractionOptions::default()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::NoEligibleProvider(_)));
    }
}
