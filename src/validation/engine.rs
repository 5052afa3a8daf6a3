use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::autofix::{auto_fix, AutoFixOutcome};
use super::rules::{self, Report, RuleContext};
use crate::cache::{Cache, LruCache};
use crate::core::ValidationConfig;
use crate::jurisdiction::GstRateTable;
use crate::models::{Finding, Invoice, Severity, ValidationMetadata, ValidationResult};
use crate::storage::InvoiceLookup;

const CRITICAL_PENALTY: i32 = 20;
const ERROR_PENALTY: i32 = 10;
const WARNING_PENALTY: i32 = 2;
const COMPLETENESS_BONUS: i32 = 2;

/// Rule-based compliance checker. Never fails: problems are reported as findings.
pub struct ValidationEngine {
    rates: GstRateTable,
    config: ValidationConfig,
    lookup: Option<Arc<dyn InvoiceLookup>>,
    cache: Option<Arc<dyn Cache<ValidationResult>>>,
}

impl ValidationEngine {
    pub fn new(rates: GstRateTable, config: ValidationConfig, lookup: Option<Arc<dyn InvoiceLookup>>) -> Self {
        let cache: Option<Arc<dyn Cache<ValidationResult>>> = if config.cache_enabled {
            Some(Arc::new(LruCache::new(config.cache_capacity)))
        } else {
            None
        };
        ValidationEngine {
            rates,
            config,
            lookup,
            cache,
        }
    }

    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.id))]
    pub async fn validate(&self, invoice: &Invoice) -> ValidationResult {
        self.validate_as_of(invoice, Utc::now().date_naive()).await
    }

    /// Validate as if today were `today`.
    pub async fn validate_as_of(&self, invoice: &Invoice, today: NaiveDate) -> ValidationResult {
        let key = fingerprint(invoice);
        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(hit) = cache.get(key).await {
                debug!(key = %key, "validation cache hit");
                return hit;
            }
        }

        let duplicate_number = self.is_duplicate(invoice).await;
        let (rate, effective_date) = self.rates.effective(invoice.invoice_date);
        let ctx = RuleContext {
            rates: &self.rates,
            config: &self.config,
            today,
            rate,
            effective_date: invoice.invoice_date.unwrap_or(effective_date),
            duplicate_number,
        };

        let mut report = Report::default();
        rules::structural::check(invoice, &ctx, &mut report);
        rules::tax::check(invoice, &ctx, &mut report);
        rules::business::check(invoice, &ctx, &mut report);
        rules::peppol::check(invoice, &ctx, &mut report);
        rules::jurisdiction::check(invoice, &ctx, &mut report);

        let result = ValidationResult {
            is_valid: !report.findings.iter().any(|f| f.severity == Severity::Critical),
            score: score(&report.findings, invoice),
            findings: report.findings,
            suggestions: report.suggestions,
            metadata: ValidationMetadata {
                effective_tax_rate: rate,
                effective_date: ctx.effective_date,
            },
        };

        debug!(
            score = result.score,
            findings = result.findings.len(),
            critical = result.critical_count(),
            "validation finished"
        );

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            cache.put(key, result.clone()).await;
        }
        result
    }

    /// Apply the result's suggestions at the configured confidence floor.
    pub fn auto_fix(&self, invoice: &Invoice, result: &ValidationResult) -> AutoFixOutcome {
        auto_fix(invoice, result, &self.rates, self.config.auto_fix_min_confidence)
    }

    async fn is_duplicate(&self, invoice: &Invoice) -> bool {
        let (Some(lookup), Some(number)) = (&self.lookup, invoice.invoice_number.as_deref()) else {
            return false;
        };
        let number = number.trim();
        if number.is_empty() {
            return false;
        }
        match lookup.invoice_number_exists(invoice.owner_id, number, Some(invoice.id)).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(error = %e, "duplicate invoice number lookup failed, skipping check");
                false
            }
        }
    }
}

/// Coarse content key: number, date and total. Different invoices can share it.
fn fingerprint(invoice: &Invoice) -> Option<String> {
    let number = invoice.invoice_number.as_deref()?;
    Some(format!(
        "{}|{}|{}|{}",
        invoice.owner_id,
        number,
        invoice.invoice_date.map(|d| d.to_string()).unwrap_or_default(),
        invoice.total_amount.map(|t| t.normalize().to_string()).unwrap_or_default()
    ))
}

pub fn score(findings: &[Finding], invoice: &Invoice) -> u8 {
    let penalty: i32 = findings
        .iter()
        .map(|f| match f.severity {
            Severity::Critical => CRITICAL_PENALTY,
            Severity::Error => ERROR_PENALTY,
            Severity::Warning => WARNING_PENALTY,
        })
        .sum();

    let bonuses = [
        invoice.vendor.has_identifier(),
        invoice.customer.has_identifier(),
        invoice.payment_terms_days.is_some() || invoice.due_date.is_some(),
        !invoice.line_items.is_empty(),
    ]
    .iter()
    .filter(|present| **present)
    .count() as i32;

    (100 - penalty + bonuses * COMPLETENESS_BONUS).clamp(0, 100) as u8
}
