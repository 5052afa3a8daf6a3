use chrono::Months;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{Report, RuleContext};
use crate::models::{Finding, Invoice};

static INVOICE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9/_.#-]{0,49}$").expect("valid invoice number regex"));

pub fn check(invoice: &Invoice, ctx: &RuleContext<'_>, report: &mut Report) {
    match invoice.invoice_number.as_deref().map(str::trim) {
        None | Some("") => report.push(Finding::error(
            "invoice_number",
            "MISSING_INVOICE_NUMBER",
            "Invoice number is required",
        )),
        Some(number) if !INVOICE_NUMBER.is_match(number) => report.push(Finding::error(
            "invoice_number",
            "INVALID_INVOICE_NUMBER",
            format!("Invoice number '{}' may only contain letters, digits and / _ . # -", number),
        )),
        Some(number) if ctx.duplicate_number => report.push(Finding::error(
            "invoice_number",
            "DUPLICATE_INVOICE_NUMBER",
            format!("Invoice number '{}' is already used by another invoice", number),
        )),
        Some(_) => {}
    }

    match invoice.invoice_date {
        None => report.push(Finding::error("invoice_date", "MISSING_INVOICE_DATE", "Invoice date is required")),
        Some(date) if date > ctx.today => report.push(Finding::error(
            "invoice_date",
            "FUTURE_INVOICE_DATE",
            format!("Invoice date {} is in the future", date),
        )),
        Some(date) => {
            let retention_start = ctx
                .today
                .checked_sub_months(Months::new(ctx.config.retention_years.max(0) as u32 * 12))
                .unwrap_or(ctx.today);
            if date < retention_start {
                report.push(Finding::warning(
                    "invoice_date",
                    "BEYOND_RETENTION_PERIOD",
                    format!(
                        "Invoice date {} is older than the {}-year record retention period",
                        date, ctx.config.retention_years
                    ),
                ));
            }
        }
    }

    if invoice.customer.name.as_deref().map(str::trim).unwrap_or("").is_empty() {
        report.push(Finding::error("customer.name", "MISSING_CUSTOMER_NAME", "Customer name is required"));
    }

    if invoice.total_amount.is_none() {
        report.push(Finding::error("total_amount", "MISSING_TOTAL", "Total amount is required"));
    }
}
