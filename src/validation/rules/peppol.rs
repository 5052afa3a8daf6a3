//! Mandatory fields of a Peppol BIS Billing 3.0 invoice.

use super::{Report, RuleContext};
use crate::extraction::identifiers::is_valid_gst_number;
use crate::jurisdiction::CURRENCY;
use crate::models::{FieldValue, Finding, Invoice};

fn blank(value: Option<&String>) -> bool {
    value.map(|s| s.trim().is_empty()).unwrap_or(true)
}

pub fn check(invoice: &Invoice, _ctx: &RuleContext<'_>, report: &mut Report) {
    let mut missing = |present: bool, field: &str, code: &str, what: &str| {
        if !present {
            report.push(Finding::critical(field, code, format!("{} is mandatory for InvoiceNow", what)));
        }
    };

    missing(!blank(invoice.invoice_number.as_ref()), "invoice_number", "PEPPOL-BR-02", "Invoice number");
    missing(invoice.invoice_date.is_some(), "invoice_date", "PEPPOL-BR-03", "Issue date");
    missing(!blank(invoice.currency.as_ref()), "currency", "PEPPOL-BR-05", "Invoice currency code");
    missing(!blank(invoice.vendor.name.as_ref()), "vendor.name", "PEPPOL-BR-06", "Seller name");
    missing(!blank(invoice.customer.name.as_ref()), "customer.name", "PEPPOL-BR-07", "Buyer name");
    missing(
        invoice.vendor.gst_registration_number.is_some(),
        "vendor.gst_registration_number",
        "PEPPOL-BR-CO-09",
        "Seller tax identifier",
    );
    missing(!invoice.line_items.is_empty(), "line_items", "PEPPOL-BR-16", "At least one invoice line");

    if blank(invoice.currency.as_ref()) {
        let registered = invoice
            .vendor
            .gst_registration_number
            .as_deref()
            .map(is_valid_gst_number)
            .unwrap_or(false);
        let confidence = if registered { 0.85 } else { 0.6 };
        report.suggest("currency", FieldValue::Text(CURRENCY.to_string()), confidence);
    }
}
