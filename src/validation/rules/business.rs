use rust_decimal::Decimal;

use super::{line_path, Report, RuleContext};
use crate::models::{cent, round_money, within, FieldValue, Finding, Invoice, TaxCategory};

pub fn check(invoice: &Invoice, ctx: &RuleContext<'_>, report: &mut Report) {
    check_dates(invoice, ctx, report);
    check_lines(invoice, ctx, report);
}

fn check_dates(invoice: &Invoice, ctx: &RuleContext<'_>, report: &mut Report) {
    if let (Some(date), Some(due)) = (invoice.invoice_date, invoice.due_date) {
        if due < date {
            report.push(Finding::error(
                "due_date",
                "DUE_DATE_BEFORE_INVOICE_DATE",
                format!("Due date {} is before the invoice date {}", due, date),
            ));
        }
    }

    let terms = invoice.payment_terms_days.or_else(|| match (invoice.invoice_date, invoice.due_date) {
        (Some(date), Some(due)) => Some((due - date).num_days()),
        _ => None,
    });
    if let Some(days) = terms {
        if days < 0 || days > ctx.config.max_payment_terms_days {
            report.push(Finding::warning(
                "payment_terms_days",
                "PAYMENT_TERMS_OUT_OF_RANGE",
                format!(
                    "Payment terms of {} days are outside 0-{} days",
                    days, ctx.config.max_payment_terms_days
                ),
            ));
        }
    }
}

fn check_lines(invoice: &Invoice, ctx: &RuleContext<'_>, report: &mut Report) {
    for (i, item) in invoice.line_items.iter().enumerate() {
        if item.description.trim().is_empty() {
            report.push(Finding::error(
                line_path(i, "description"),
                "EMPTY_LINE_DESCRIPTION",
                format!("Line {} has no description", i + 1),
            ));
        }
        if item.quantity <= Decimal::ZERO {
            report.push(Finding::error(
                line_path(i, "quantity"),
                "INVALID_QUANTITY",
                format!("Line {} quantity must be positive", i + 1),
            ));
        }
        if item.unit_price < Decimal::ZERO {
            report.push(Finding::error(
                line_path(i, "unit_price"),
                "NEGATIVE_UNIT_PRICE",
                format!("Line {} unit price is negative", i + 1),
            ));
        }

        let expected_amount = round_money(item.quantity * item.unit_price);
        if item.quantity > Decimal::ZERO && !within(item.amount, expected_amount, cent()) {
            report.push(Finding::error(
                line_path(i, "amount"),
                "INCORRECT_LINE_AMOUNT",
                format!("Line {} amount {} should be {}", i + 1, item.amount, expected_amount),
            ));
            report.suggest(line_path(i, "amount"), FieldValue::Amount(expected_amount), 0.85);
        }

        check_line_rate(i, item.tax_category, item.tax_rate, ctx, report);
    }
}

fn check_line_rate(
    i: usize,
    category: Option<TaxCategory>,
    rate: Option<Decimal>,
    ctx: &RuleContext<'_>,
    report: &mut Report,
) {
    let (Some(category), Some(rate)) = (category, rate) else {
        return;
    };
    let expected = match category {
        TaxCategory::Standard => ctx.rate,
        TaxCategory::ZeroRated => Decimal::ZERO,
        _ => return,
    };
    if rate != expected {
        report.push(Finding::error(
            line_path(i, "tax_rate"),
            "TAX_RATE_MISMATCH",
            format!(
                "Line {} is {} but carries {}% instead of {}%",
                i + 1,
                match category {
                    TaxCategory::Standard => "standard-rated",
                    _ => "zero-rated",
                },
                rate,
                expected
            ),
        ));
        report.suggest(line_path(i, "tax_rate"), FieldValue::Rate(expected), 0.9);
    }
}
