use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::jurisdiction::GstRateTable;
use crate::models::{round_money, Invoice, LineItem, SpecialScheme, TaxCategory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

/// Rate applying to the whole invoice; digital payment token supplies are exempt.
pub fn invoice_rate(invoice: &Invoice, effective_rate: Decimal) -> Decimal {
    if invoice.special_scheme == Some(SpecialScheme::DigitalPaymentToken) {
        Decimal::ZERO
    } else {
        effective_rate
    }
}

/// Rate a line should be taxed at: zero for untaxed categories or an explicit 0%,
/// otherwise the rate effective on the invoice date.
pub fn line_rate(item: &LineItem, effective_rate: Decimal) -> Decimal {
    match (item.tax_category, item.tax_rate) {
        (Some(category), _) if category.is_untaxed() => Decimal::ZERO,
        (None, Some(rate)) if rate.is_zero() => Decimal::ZERO,
        _ => effective_rate,
    }
}

/// Totals computed from line items, tax rounded once per rate.
pub fn from_line_items(items: &[LineItem], effective_rate: Decimal, rates: &GstRateTable) -> Totals {
    let mut by_rate: BTreeMap<Decimal, Decimal> = BTreeMap::new();
    for item in items {
        *by_rate.entry(line_rate(item, effective_rate)).or_default() += item.amount;
    }

    let subtotal = round_money(items.iter().map(|i| i.amount).sum());
    let tax = by_rate.iter().map(|(rate, amount)| rates.tax_for(*amount, *rate)).sum();
    Totals {
        subtotal,
        tax,
        total: subtotal + tax,
    }
}

/// Totals implied by a stated subtotal when there are no line items.
pub fn from_subtotal(subtotal: Decimal, effective_rate: Decimal, rates: &GstRateTable) -> Totals {
    let subtotal = round_money(subtotal);
    let tax = rates.tax_for(subtotal, effective_rate);
    Totals {
        subtotal,
        tax,
        total: subtotal + tax,
    }
}

pub fn has_untaxed_line(items: &[LineItem]) -> bool {
    items.iter().any(|i| match i.tax_category {
        Some(category) => category != TaxCategory::Standard,
        None => i.tax_rate.map(|r| r.is_zero()).unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_rate_lines() {
        let rates = GstRateTable::default();
        let mut zero = LineItem::new("Export freight", Decimal::ONE, Decimal::from(500));
        zero.tax_category = Some(TaxCategory::ZeroRated);
        let items = vec![LineItem::new("Consulting", Decimal::from(10), Decimal::from(100)), zero];

        let totals = from_line_items(&items, Decimal::from(9), &rates);

        assert_eq!(totals.subtotal, Decimal::from(1500));
        assert_eq!(totals.tax, Decimal::from(90));
        assert_eq!(totals.total, Decimal::from(1590));
        assert!(has_untaxed_line(&items));
    }
}
