use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::totals;
use crate::jurisdiction::GstRateTable;
use crate::models::{FieldValue, Invoice, LineItem, Suggestion, ValidationResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedFix {
    pub field: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoFixOutcome {
    pub invoice: Invoice,
    pub applied: Vec<AppliedFix>,
}

/// Apply confident, auto-fixable suggestions and recompute the totals from the line items.
/// Running it again on its own output with the same result changes nothing.
pub fn auto_fix(invoice: &Invoice, result: &ValidationResult, rates: &GstRateTable, min_confidence: f64) -> AutoFixOutcome {
    let mut fixed = invoice.clone();

    for suggestion in result
        .suggestions
        .iter()
        .filter(|s| s.auto_fixable && s.confidence >= min_confidence)
    {
        if !apply(&mut fixed, suggestion) {
            tracing::debug!(field = %suggestion.field, value = %suggestion.value, "suggestion not applicable");
        }
    }

    recompute_totals(&mut fixed, rates);

    let before = snapshot(invoice);
    let after = snapshot(&fixed);
    let applied = after
        .iter()
        .filter(|(field, value)| before.get(*field) != Some(*value))
        .map(|(field, value)| AppliedFix {
            field: field.clone(),
            before: before.get(field).cloned().flatten(),
            after: value.clone(),
        })
        .collect();

    AutoFixOutcome { invoice: fixed, applied }
}

pub fn recompute_totals(invoice: &mut Invoice, rates: &GstRateTable) {
    if !invoice.line_items.is_empty() {
        let (effective, _) = rates.effective(invoice.invoice_date);
        let rate = totals::invoice_rate(invoice, effective);
        let computed = totals::from_line_items(&invoice.line_items, rate, rates);
        invoice.subtotal = Some(computed.subtotal);
        invoice.tax_amount = Some(computed.tax);
        invoice.total_amount = Some(computed.total);
    } else if let (Some(subtotal), Some(tax)) = (invoice.subtotal, invoice.tax_amount) {
        invoice.total_amount = Some(subtotal + tax);
    }
}

fn apply(invoice: &mut Invoice, suggestion: &Suggestion) -> bool {
    if let Some((index, field)) = parse_line_path(&suggestion.field) {
        return match invoice.line_items.get_mut(index) {
            Some(item) => apply_line(item, field, &suggestion.value),
            None => false,
        };
    }

    match (suggestion.field.as_str(), &suggestion.value) {
        ("invoice_number", FieldValue::Text(v)) => invoice.invoice_number = Some(v.clone()),
        ("currency", FieldValue::Text(v)) => invoice.currency = Some(v.clone()),
        ("peppol_participant_id", FieldValue::Text(v)) => invoice.peppol_participant_id = Some(v.clone()),
        ("customer.name", FieldValue::Text(v)) => invoice.customer.name = Some(v.clone()),
        ("customer.uen", FieldValue::Text(v)) => invoice.customer.uen = Some(v.clone()),
        ("vendor.name", FieldValue::Text(v)) => invoice.vendor.name = Some(v.clone()),
        ("vendor.uen", FieldValue::Text(v)) => invoice.vendor.uen = Some(v.clone()),
        ("vendor.gst_registration_number", FieldValue::Text(v)) => {
            invoice.vendor.gst_registration_number = Some(v.clone())
        }
        ("invoice_date", FieldValue::Date(d)) => invoice.invoice_date = Some(*d),
        ("due_date", FieldValue::Date(d)) => invoice.due_date = Some(*d),
        ("subtotal", FieldValue::Amount(a)) => invoice.subtotal = Some(*a),
        ("tax_amount", FieldValue::Amount(a)) => invoice.tax_amount = Some(*a),
        ("total_amount", FieldValue::Amount(a)) => invoice.total_amount = Some(*a),
        _ => return false,
    }
    true
}

fn apply_line(item: &mut LineItem, field: &str, value: &FieldValue) -> bool {
    match (field, value) {
        ("description", FieldValue::Text(v)) => item.description = v.clone(),
        ("quantity", FieldValue::Amount(a)) => item.quantity = *a,
        ("unit_price", FieldValue::Amount(a)) => item.unit_price = *a,
        ("amount", FieldValue::Amount(a)) => item.amount = *a,
        ("tax_rate", FieldValue::Rate(r)) => item.tax_rate = Some(*r),
        ("tax_category", FieldValue::Category(c)) => item.tax_category = Some(*c),
        _ => return false,
    }
    true
}

/// `line_items[3].tax_rate` -> (3, "tax_rate")
fn parse_line_path(path: &str) -> Option<(usize, &str)> {
    let rest = path.strip_prefix("line_items[")?;
    let (index, field) = rest.split_once("].")?;
    Some((index.parse().ok()?, field))
}

fn snapshot(invoice: &Invoice) -> BTreeMap<String, Option<String>> {
    let mut fields = BTreeMap::new();
    let text = |v: &Option<String>| v.clone();
    fields.insert("invoice_number".to_string(), text(&invoice.invoice_number));
    fields.insert("invoice_date".to_string(), invoice.invoice_date.map(|d| d.to_string()));
    fields.insert("due_date".to_string(), invoice.due_date.map(|d| d.to_string()));
    fields.insert("currency".to_string(), text(&invoice.currency));
    fields.insert("peppol_participant_id".to_string(), text(&invoice.peppol_participant_id));
    fields.insert("customer.name".to_string(), text(&invoice.customer.name));
    fields.insert("customer.uen".to_string(), text(&invoice.customer.uen));
    fields.insert("vendor.name".to_string(), text(&invoice.vendor.name));
    fields.insert("vendor.uen".to_string(), text(&invoice.vendor.uen));
    fields.insert(
        "vendor.gst_registration_number".to_string(),
        text(&invoice.vendor.gst_registration_number),
    );
    fields.insert("subtotal".to_string(), invoice.subtotal.map(|a| a.normalize().to_string()));
    fields.insert("tax_amount".to_string(), invoice.tax_amount.map(|a| a.normalize().to_string()));
    fields.insert("total_amount".to_string(), invoice.total_amount.map(|a| a.normalize().to_string()));
    for (i, item) in invoice.line_items.iter().enumerate() {
        let key = |f: &str| format!("line_items[{}].{}", i, f);
        fields.insert(key("description"), Some(item.description.clone()));
        fields.insert(key("quantity"), Some(item.quantity.normalize().to_string()));
        fields.insert(key("unit_price"), Some(item.unit_price.normalize().to_string()));
        fields.insert(key("amount"), Some(item.amount.normalize().to_string()));
        fields.insert(key("tax_rate"), item.tax_rate.map(|r| r.normalize().to_string()));
        fields.insert(key("tax_category"), item.tax_category.map(|c| c.code().to_string()));
    }
    fields
}
