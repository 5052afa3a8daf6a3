//! Rule groups. Each group inspects the invoice and appends findings and suggestions.

pub mod business;
pub mod jurisdiction;
pub mod peppol;
pub mod structural;
pub mod tax;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::core::ValidationConfig;
use crate::jurisdiction::GstRateTable;
use crate::models::{FieldValue, Finding, Suggestion};

pub struct RuleContext<'a> {
    pub rates: &'a GstRateTable,
    pub config: &'a ValidationConfig,
    pub today: NaiveDate,
    /// Percent rate effective on `effective_date`.
    pub rate: Decimal,
    pub effective_date: NaiveDate,
    /// Another invoice of the same owner already carries this number.
    pub duplicate_number: bool,
}

#[derive(Debug, Default)]
pub struct Report {
    pub findings: Vec<Finding>,
    pub suggestions: Vec<Suggestion>,
}

impl Report {
    pub fn push(&mut self, finding: Finding) {
        self.findings.push(finding);
    }

    pub fn suggest(&mut self, field: impl Into<String>, value: FieldValue, confidence: f64) {
        self.suggestions.push(Suggestion::new(field, value, confidence, true));
    }
}

pub fn line_path(index: usize, field: &str) -> String {
    format!("line_items[{}].{}", index, field)
}
