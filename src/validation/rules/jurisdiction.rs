//! Singapore-specific checks: InvoiceNow mandate and special GST schemes.

use rust_decimal::Decimal;

use super::{line_path, Report, RuleContext};
use crate::extraction::identifiers::{is_valid_participant_id, is_valid_uen};
use crate::jurisdiction::{invoicenow_mandate_date, tourist_refund_minimum, CURRENCY, PEPPOL_SCHEME};
use crate::models::{FieldValue, Finding, Invoice, SpecialScheme, TaxCategory};

pub fn check(invoice: &Invoice, _ctx: &RuleContext<'_>, report: &mut Report) {
    check_mandate(invoice, report);
    check_currency(invoice, report);
    match invoice.special_scheme {
        Some(SpecialScheme::TouristRefund) => check_tourist_refund(invoice, report),
        Some(SpecialScheme::DigitalPaymentToken) => check_digital_payment_token(invoice, report),
        None => {}
    }
}

fn check_mandate(invoice: &Invoice, report: &mut Report) {
    match invoice.peppol_participant_id.as_deref() {
        Some(id) if !is_valid_participant_id(id) => {
            report.push(Finding::error(
                "peppol_participant_id",
                "INVALID_PEPPOL_ID",
                format!("'{}' is not a valid participant id ({}<UEN>)", id, PEPPOL_SCHEME),
            ));
        }
        Some(_) => {}
        None => {
            let after_mandate = invoice.invoice_date.map(|d| d >= invoicenow_mandate_date()).unwrap_or(false);
            if after_mandate {
                report.push(Finding::warning(
                    "peppol_participant_id",
                    "MISSING_PEPPOL_ID",
                    format!(
                        "Invoices dated from {} should be sent over InvoiceNow with a participant id",
                        invoicenow_mandate_date()
                    ),
                ));
                if let Some(uen) = invoice.vendor.uen.as_deref().filter(|u| is_valid_uen(u)) {
                    report.suggest(
                        "peppol_participant_id",
                        FieldValue::Text(format!("{}{}", PEPPOL_SCHEME, uen)),
                        0.9,
                    );
                }
            }
        }
    }
}

fn check_currency(invoice: &Invoice, report: &mut Report) {
    if let Some(currency) = invoice.currency.as_deref() {
        let taxed = invoice.tax_amount.map(|t| !t.is_zero()).unwrap_or(false);
        if !currency.eq_ignore_ascii_case(CURRENCY) && taxed {
            report.push(Finding::warning(
                "currency",
                "FOREIGN_CURRENCY_GST",
                format!("GST on a {} invoice must also be stated in {}", currency, CURRENCY),
            ));
        }
    }
}

fn check_tourist_refund(invoice: &Invoice, report: &mut Report) {
    if let Some(total) = invoice.total_amount {
        if total < tourist_refund_minimum() {
            report.push(Finding::error(
                "total_amount",
                "TRS_BELOW_MINIMUM",
                format!(
                    "Tourist Refund Scheme claims need a purchase of at least S${}, got {}",
                    tourist_refund_minimum(),
                    total
                ),
            ));
        }
    }
}

/// Digital payment token supplies are exempt from GST.
fn check_digital_payment_token(invoice: &Invoice, report: &mut Report) {
    if invoice.tax_amount.map(|t| t > Decimal::ZERO).unwrap_or(false) {
        report.push(Finding::error(
            "tax_amount",
            "DPT_GST_CHARGED",
            "Digital payment token transactions are exempt from GST",
        ));
        report.suggest("tax_amount", FieldValue::Amount(Decimal::ZERO), 0.9);
    }
    for (i, item) in invoice.line_items.iter().enumerate() {
        if item.tax_category != Some(TaxCategory::Exempt) {
            report.suggest(line_path(i, "tax_category"), FieldValue::Category(TaxCategory::Exempt), 0.9);
        }
    }
}
