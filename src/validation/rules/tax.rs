use rust_decimal::Decimal;

use super::{Report, RuleContext};
use crate::extraction::identifiers::{is_valid_gst_number, is_valid_uen, normalize_identifier};
use crate::models::{cent, within, FieldValue, Finding, Invoice, Party};
use crate::validation::totals;

const SERVICE_WORDS: &[&str] = &[
    "service",
    "consult",
    "subscription",
    "licence",
    "license",
    "software",
    "saas",
    "support",
    "advisory",
    "design",
    "marketing",
    "hosting",
    "maintenance",
    "training",
    "development",
];

const BUSINESS_MARKERS: &[&str] = &["pte", "ltd", "llp", "inc", "corp", "company", "limited", "llc", "gmbh"];

pub fn check(invoice: &Invoice, ctx: &RuleContext<'_>, report: &mut Report) {
    check_registration(invoice, report);
    check_totals(invoice, ctx, report);
    check_zero_tax(invoice, ctx, report);
    check_reverse_charge(invoice, report);
}

fn check_registration(invoice: &Invoice, report: &mut Report) {
    match invoice.vendor.gst_registration_number.as_deref() {
        None => report.push(Finding::critical(
            "vendor.gst_registration_number",
            "MISSING_GST_NUMBER",
            "Vendor GST registration number is required on a tax invoice",
        )),
        Some(raw) if !is_valid_gst_number(raw) => {
            report.push(Finding::error(
                "vendor.gst_registration_number",
                "INVALID_GST_NUMBER",
                format!("'{}' is not a valid GST registration number", raw),
            ));
            let normalized = normalize_identifier(raw);
            if is_valid_gst_number(&normalized) {
                report.suggest("vendor.gst_registration_number", FieldValue::Text(normalized), 0.9);
            }
        }
        Some(_) => {}
    }

    for (path, party) in [("vendor.uen", &invoice.vendor), ("customer.uen", &invoice.customer)] {
        if let Some(raw) = party.uen.as_deref() {
            if !is_valid_uen(raw) {
                report.push(Finding::error(path, "INVALID_UEN", format!("'{}' is not a valid UEN", raw)));
                let normalized = normalize_identifier(raw);
                if is_valid_uen(&normalized) {
                    report.suggest(path, FieldValue::Text(normalized), 0.9);
                }
            }
        }
    }
}

fn check_totals(invoice: &Invoice, ctx: &RuleContext<'_>, report: &mut Report) {
    let rate = totals::invoice_rate(invoice, ctx.rate);
    let expected = if !invoice.line_items.is_empty() {
        totals::from_line_items(&invoice.line_items, rate, ctx.rates)
    } else if let Some(subtotal) = invoice.subtotal {
        totals::from_subtotal(subtotal, rate, ctx.rates)
    } else {
        return;
    };

    if !invoice.line_items.is_empty() {
        if let Some(subtotal) = invoice.subtotal {
            if !within(subtotal, expected.subtotal, cent()) {
                report.push(Finding::error(
                    "subtotal",
                    "INCORRECT_SUBTOTAL",
                    format!("Subtotal {} does not match the line items ({})", subtotal, expected.subtotal),
                ));
                report.suggest("subtotal", FieldValue::Amount(expected.subtotal), 0.95);
            }
        }
    }

    if let Some(tax) = invoice.tax_amount {
        if !within(tax, expected.tax, cent()) {
            report.push(Finding::error(
                "tax_amount",
                "INCORRECT_TAX",
                format!("GST {} does not match {}% of the taxable amount ({})", tax, rate, expected.tax),
            ));
            report.suggest("tax_amount", FieldValue::Amount(expected.tax), 0.9);
        }
    }

    if let Some(total) = invoice.total_amount {
        if !within(total, expected.total, cent()) {
            report.push(Finding::error(
                "total_amount",
                "INCORRECT_TOTAL",
                format!("Total {} should be {} (subtotal + GST)", total, expected.total),
            ));
            report.suggest("total_amount", FieldValue::Amount(expected.total), 0.95);
        }
    }
}

fn check_zero_tax(invoice: &Invoice, ctx: &RuleContext<'_>, report: &mut Report) {
    let taxable = invoice.subtotal.map(|s| s > Decimal::ZERO).unwrap_or(false);
    let zero_tax = invoice.tax_amount.map(|t| t.is_zero()).unwrap_or(false);
    if zero_tax && taxable && !ctx.rate.is_zero() && !totals::has_untaxed_line(&invoice.line_items) {
        report.push(Finding::warning(
            "tax_amount",
            "ZERO_TAX_WITHOUT_EXEMPTION",
            "No GST charged but no line is zero-rated or exempt",
        ));
    }
}

fn looks_foreign(address: &str) -> bool {
    let lower = address.to_lowercase();
    let local = lower.contains("singapore") || lower.split(|c: char| !c.is_ascii_digit()).any(|run| run.len() == 6);
    !local
}

fn is_business(party: &Party) -> bool {
    if party.uen.is_some() || party.gst_registration_number.is_some() {
        return true;
    }
    party
        .name
        .as_deref()
        .map(|name| {
            let lower = name.to_lowercase();
            lower
                .split(|c: char| !c.is_alphanumeric())
                .any(|word| BUSINESS_MARKERS.contains(&word))
        })
        .unwrap_or(false)
}

/// Imported services bought by a GST-registered business fall under reverse charge.
fn check_reverse_charge(invoice: &Invoice, report: &mut Report) {
    let foreign_vendor = invoice.vendor.address.as_deref().map(looks_foreign).unwrap_or(false);
    let unregistered = invoice.vendor.gst_registration_number.is_none();
    let services = invoice.line_items.iter().any(|item| {
        let lower = item.description.to_lowercase();
        SERVICE_WORDS.iter().any(|w| lower.contains(w))
    });

    if foreign_vendor && unregistered && services && is_business(&invoice.customer) {
        report.push(Finding::warning(
            "tax_amount",
            "POSSIBLE_REVERSE_CHARGE",
            "Imported services from an overseas vendor may require reverse-charge GST accounting by the customer",
        ));
    }
}
