//! Confidence scoring for extraction results.

use rust_decimal::Decimal;

use super::similarity::is_similar;
use crate::models::{within, ExtractedFields, ExtractionResult};

const REQUIRED_WEIGHT: f64 = 2.0;
const OPTIONAL_WEIGHT: f64 = 1.0;
const LINE_ITEM_BONUS: f64 = 1.0;
// 4 required, 4 optional, 1 bonus
const MAX_POINTS: f64 = 4.0 * REQUIRED_WEIGHT + 4.0 * OPTIONAL_WEIGHT + LINE_ITEM_BONUS;

const NUMBER_WEIGHT: f64 = 0.4;
const CUSTOMER_WEIGHT: f64 = 0.3;
const TOTAL_WEIGHT: f64 = 0.3;

/// Field-presence confidence of a single source's output, in [0, 1].
pub fn score_fields(fields: &ExtractedFields) -> f64 {
    let mut points = 0.0;

    let required = [
        fields.invoice_number.is_some(),
        fields.invoice_date.is_some(),
        fields.customer.name.is_some(),
        fields.total_amount.is_some(),
    ];
    points += required.iter().filter(|present| **present).count() as f64 * REQUIRED_WEIGHT;

    let optional = [
        fields.customer.uen.is_some() || fields.vendor.uen.is_some(),
        fields.vendor.name.is_some(),
        fields.tax_amount.is_some(),
        fields.subtotal.is_some(),
    ];
    points += optional.iter().filter(|present| **present).count() as f64 * OPTIONAL_WEIGHT;

    if let (Some(sum), Some(subtotal)) = (fields.line_items_sum(), fields.subtotal) {
        if within(sum, subtotal, Decimal::ONE) {
            points += LINE_ITEM_BONUS;
        }
    }

    (points / MAX_POINTS).clamp(0.0, 1.0)
}

/// Agreement of all collected results with the final fields on the key fields,
/// blended evenly with the sources' average confidence.
pub fn consensus_confidence(final_fields: &ExtractedFields, results: &[ExtractionResult], name_threshold: f64) -> f64 {
    if results.is_empty() {
        return score_fields(final_fields);
    }

    let n = results.len() as f64;

    let number_agreement = match &final_fields.invoice_number {
        Some(number) => {
            results
                .iter()
                .filter(|r| {
                    r.fields
                        .invoice_number
                        .as_deref()
                        .map(|other| other.trim().eq_ignore_ascii_case(number.trim()))
                        .unwrap_or(false)
                })
                .count() as f64
                / n
        }
        None => 0.0,
    };

    let customer_agreement = match &final_fields.customer.name {
        Some(name) => {
            results
                .iter()
                .filter(|r| {
                    r.fields
                        .customer
                        .name
                        .as_deref()
                        .map(|other| is_similar(other, name, name_threshold))
                        .unwrap_or(false)
                })
                .count() as f64
                / n
        }
        None => 0.0,
    };

    let total_agreement = match final_fields.total_amount {
        Some(total) => {
            results
                .iter()
                .filter(|r| r.fields.total_amount.map(|t| within(t, total, Decimal::ONE)).unwrap_or(false))
                .count() as f64
                / n
        }
        None => 0.0,
    };

    let agreement =
        NUMBER_WEIGHT * number_agreement + CUSTOMER_WEIGHT * customer_agreement + TOTAL_WEIGHT * total_agreement;
    let average = results.iter().map(|r| r.confidence).sum::<f64>() / n;

    (0.5 * agreement + 0.5 * average).clamp(0.0, 1.0)
}
