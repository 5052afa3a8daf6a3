use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::TaxCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Dotted path, with `line_items[i]` for per-line fields.
    pub field: String,
    pub code: String,
    pub message: String,
    pub severity: Severity,
}

impl Finding {
    pub fn new(field: impl Into<String>, code: &str, message: impl Into<String>, severity: Severity) -> Self {
        Finding {
            field: field.into(),
            code: code.to_string(),
            message: message.into(),
            severity,
        }
    }

    pub fn warning(field: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self::new(field, code, message, Severity::Warning)
    }

    pub fn error(field: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self::new(field, code, message, Severity::Error)
    }

    pub fn critical(field: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self::new(field, code, message, Severity::Critical)
    }
}

/// Value proposed by a suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Amount(Decimal),
    Rate(Decimal),
    Date(NaiveDate),
    Category(TaxCategory),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => write!(f, "{}", s),
            FieldValue::Amount(d) => write!(f, "{:.2}", d),
            FieldValue::Rate(d) => write!(f, "{}%", d),
            FieldValue::Date(d) => write!(f, "{}", d),
            FieldValue::Category(c) => write!(f, "{}", c.code()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub field: String,
    pub value: FieldValue,
    pub confidence: f64,
    pub auto_fixable: bool,
}

impl Suggestion {
    pub fn new(field: impl Into<String>, value: FieldValue, confidence: f64, auto_fixable: bool) -> Self {
        Suggestion {
            field: field.into(),
            value,
            confidence,
            auto_fixable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetadata {
    /// Percent rate effective on `effective_date`.
    pub effective_tax_rate: Decimal,
    pub effective_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub findings: Vec<Finding>,
    pub suggestions: Vec<Suggestion>,
    pub score: u8,
    pub metadata: ValidationMetadata,
}

impl ValidationResult {
    pub fn critical_count(&self) -> usize {
        self.count(Severity::Critical)
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.findings.iter().filter(|f| f.severity == severity).count()
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.findings.iter().any(|f| f.code == code)
    }

    pub fn finding(&self, code: &str) -> Option<&Finding> {
        self.findings.iter().find(|f| f.code == code)
    }

    pub fn suggestion_for(&self, field: &str) -> Option<&Suggestion> {
        self.suggestions.iter().find(|s| s.field == field)
    }
}
