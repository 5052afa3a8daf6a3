//! Singapore GST constants and the historical rate table.

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::models::round_money;

/// Rate changes as (effective from, percent).
const GST_HISTORY: &[((i32, u32, u32), i64)] = &[
    ((1994, 4, 1), 3),
    ((2003, 1, 1), 4),
    ((2004, 1, 1), 5),
    ((2007, 7, 1), 7),
    ((2023, 1, 1), 8),
    ((2024, 1, 1), 9),
];

pub const CURRENCY: &str = "SGD";

/// ISO 3166-1 alpha-2.
pub const COUNTRY_CODE: &str = "SG";

/// Participant-id scheme prefix on the Peppol network.
pub const PEPPOL_SCHEME: &str = "0195:SGUEN";

pub fn invoicenow_mandate_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 11, 1).unwrap_or_default()
}

/// Minimum purchase (GST inclusive) for Tourist Refund Scheme claims.
pub fn tourist_refund_minimum() -> Decimal {
    Decimal::ONE_HUNDRED
}

#[derive(Debug, Clone)]
pub struct GstRateTable {
    changes: Vec<(NaiveDate, Decimal)>,
}

impl Default for GstRateTable {
    fn default() -> Self {
        let changes = GST_HISTORY
            .iter()
            .filter_map(|&((y, m, d), pct)| NaiveDate::from_ymd_opt(y, m, d).map(|date| (date, Decimal::from(pct))))
            .collect();
        GstRateTable { changes }
    }
}

impl GstRateTable {
    pub fn new(mut changes: Vec<(NaiveDate, Decimal)>) -> Self {
        changes.sort_by_key(|(date, _)| *date);
        GstRateTable { changes }
    }

    /// Percent rate effective on `date`; zero before GST existed.
    pub fn rate_on(&self, date: NaiveDate) -> Decimal {
        self.changes
            .iter()
            .rev()
            .find(|(from, _)| *from <= date)
            .map(|(_, rate)| *rate)
            .unwrap_or(Decimal::ZERO)
    }

    /// Rate for an invoice, falling back to today's when the date is unknown.
    /// Returns the date the rate was looked up for as well.
    pub fn effective(&self, invoice_date: Option<NaiveDate>) -> (Decimal, NaiveDate) {
        let date = invoice_date.unwrap_or_else(|| Utc::now().date_naive());
        (self.rate_on(date), date)
    }

    pub fn tax_for(&self, amount: Decimal, rate_percent: Decimal) -> Decimal {
        round_money(amount * rate_percent / Decimal::ONE_HUNDRED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_rate_changes_are_honoured_on_their_dates() {
        let table = GstRateTable::default();
        assert_eq!(table.rate_on(date(2022, 12, 31)), Decimal::from(7));
        assert_eq!(table.rate_on(date(2023, 1, 1)), Decimal::from(8));
        assert_eq!(table.rate_on(date(2023, 12, 31)), Decimal::from(8));
        assert_eq!(table.rate_on(date(2024, 1, 1)), Decimal::from(9));
        assert_eq!(table.rate_on(date(1990, 1, 1)), Decimal::ZERO);
    }

    #[test]
    fn test_tax_for_rounds_to_cents() {
        let table = GstRateTable::default();
        assert_eq!(table.tax_for(Decimal::new(1000, 0), Decimal::from(9)), Decimal::new(9000, 2));
        assert_eq!(table.tax_for(Decimal::new(3333, 2), Decimal::from(9)), Decimal::new(300, 2));
    }
}
