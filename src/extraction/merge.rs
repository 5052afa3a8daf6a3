//! Reconciliation of disagreeing extraction results.

use std::cmp::Ordering;
use std::time::Duration;

use super::similarity::is_similar;
use crate::models::ExtractionResult;

#[derive(Debug, Clone, Copy)]
pub struct MergeConfig {
    pub name_similarity_threshold: f64,
    pub line_item_min_confidence: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            name_similarity_threshold: 0.8,
            line_item_min_confidence: 0.6,
        }
    }
}

/// Merge results into one, using the most confident result as the base.
/// Returns `None` for an empty input.
pub fn merge_results(results: &[ExtractionResult], config: MergeConfig) -> Option<ExtractionResult> {
    let mut ranked: Vec<&ExtractionResult> = results.iter().collect();
    ranked.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));

    let (base, rest) = ranked.split_first()?;
    if rest.is_empty() {
        return Some((*base).clone());
    }

    let mut fields = base.fields.clone();
    let mut warnings: Vec<String> = ranked.iter().flat_map(|r| r.warnings.iter().cloned()).collect();

    for other in rest {
        for field in fields.fill_missing_from(&other.fields) {
            tracing::debug!(field, source = %other.source, "filled missing field during merge");
        }
    }

    warnings.extend(exact_disagreement(&ranked, "invoice number", |r| r.fields.invoice_number.clone()));
    warnings.extend(exact_disagreement(&ranked, "invoice date", |r| {
        r.fields.invoice_date.map(|d| d.to_string())
    }));
    warnings.extend(name_disagreement(&ranked, config.name_similarity_threshold));

    let richest = ranked
        .iter()
        .filter(|r| r.confidence > config.line_item_min_confidence)
        .max_by_key(|r| r.fields.line_items.len());
    if let Some(richest) = richest {
        if richest.fields.line_items.len() > fields.line_items.len() {
            fields.line_items = richest.fields.line_items.clone();
        }
    }

    let sources: Vec<&str> = ranked.iter().map(|r| r.source.as_str()).collect();
    let elapsed: Duration = ranked.iter().map(|r| Duration::from_millis(r.duration_ms)).sum();

    let mut merged = ExtractionResult::new(fields, base.confidence, format!("merged({})", sources.join("+")), elapsed);
    merged.warnings = warnings;
    Some(merged)
}

fn describe(result: &ExtractionResult, value: &str) -> String {
    format!("{} ({} @ {:.2})", value, result.source, result.confidence)
}

fn exact_disagreement<F>(ranked: &[&ExtractionResult], label: &str, value_of: F) -> Option<String>
where
    F: Fn(&ExtractionResult) -> Option<String>,
{
    let mut seen: Vec<(String, String)> = Vec::new();
    for result in ranked {
        if let Some(value) = value_of(*result) {
            let key = value.trim().to_ascii_uppercase();
            if !seen.iter().any(|(k, _)| *k == key) {
                seen.push((key, describe(*result, value.trim())));
            }
        }
    }

    if seen.len() > 1 {
        let listed: Vec<String> = seen.into_iter().map(|(_, d)| d).collect();
        Some(format!("{} disagreement across sources: {}", label, listed.join(", ")))
    } else {
        None
    }
}

fn name_disagreement(ranked: &[&ExtractionResult], threshold: f64) -> Option<String> {
    let mut clusters: Vec<(String, String)> = Vec::new();
    for result in ranked {
        if let Some(name) = result.fields.customer.name.as_deref() {
            if !clusters.iter().any(|(rep, _)| is_similar(rep, name, threshold)) {
                clusters.push((name.to_string(), describe(*result, name)));
            }
        }
    }

    if clusters.len() > 1 {
        let listed: Vec<String> = clusters.into_iter().map(|(_, d)| d).collect();
        Some(format!("customer name disagreement across sources: {}", listed.join(", ")))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtractedFields, LineItem};
    use rust_decimal::Decimal;

    fn result(number: &str, confidence: f64, source: &str) -> ExtractionResult {
        let fields = ExtractedFields {
            invoice_number: Some(number.to_string()),
            ..Default::default()
        };
        ExtractionResult::new(fields, confidence, source, Duration::from_millis(10))
    }

    #[test]
    fn test_disagreeing_invoice_numbers_keep_most_confident() {
        let results = vec![result("INV-002", 0.55, "openai_vision"), result("INV-001", 0.6, "document_intelligence")];

        let merged = merge_results(&results, MergeConfig::default()).unwrap();

        assert_eq!(merged.fields.invoice_number.as_deref(), Some("INV-001"));
        let warning = merged
            .warnings
            .iter()
            .find(|w| w.starts_with("invoice number disagreement"))
            .expect("disagreement warning");
        assert!(warning.contains("INV-001"));
        assert!(warning.contains("INV-002"));
    }

    #[test]
    fn test_missing_fields_come_from_next_best() {
        let mut a = result("INV-1", 0.7, "a");
        a.fields.currency = None;
        let mut b = result("INV-1", 0.5, "b");
        b.fields.currency = Some("SGD".into());
        b.fields.customer.name = Some("Globex".into());

        let merged = merge_results(&[a, b], MergeConfig::default()).unwrap();

        assert_eq!(merged.fields.currency.as_deref(), Some("SGD"));
        assert_eq!(merged.fields.customer.name.as_deref(), Some("Globex"));
        assert!(merged.warnings.is_empty());
        assert_eq!(merged.source, "merged(a+b)");
    }

    #[test]
    fn test_similar_customer_names_are_not_a_disagreement() {
        let mut a = result("INV-1", 0.7, "a");
        a.fields.customer.name = Some("Globex Pte Ltd".into());
        let mut b = result("INV-1", 0.5, "b");
        b.fields.customer.name = Some("Globex Pte. Ltd".into());
        let mut c = result("INV-1", 0.4, "c");
        c.fields.customer.name = Some("Initech Holdings".into());

        let merged = merge_results(&[a.clone(), b], MergeConfig::default()).unwrap();
        assert!(merged.warnings.is_empty());

        let merged = merge_results(&[a, c], MergeConfig::default()).unwrap();
        assert!(merged.warnings.iter().any(|w| w.contains("Initech Holdings")));
    }

    #[test]
    fn test_line_items_from_richest_confident_source() {
        let item = LineItem::new("Widget", Decimal::ONE, Decimal::TEN);
        let a = result("INV-1", 0.8, "a");
        let mut b = result("INV-1", 0.65, "b");
        b.fields.line_items = vec![item.clone(), item.clone()];
        let mut c = result("INV-1", 0.5, "c");
        c.fields.line_items = vec![item.clone(), item.clone(), item.clone()];

        let merged = merge_results(&[a, b, c], MergeConfig::default()).unwrap();

        // c has more items but sits below the 0.6 confidence floor
        assert_eq!(merged.fields.line_items.len(), 2);
    }
}
