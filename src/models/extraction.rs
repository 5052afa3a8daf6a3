use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// UNCL5305 duty/tax category of an invoice line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxCategory {
    Standard,
    ZeroRated,
    Exempt,
    OutOfScope,
    ReverseCharge,
}

impl TaxCategory {
    pub fn code(&self) -> &'static str {
        match self {
            TaxCategory::Standard => "S",
            TaxCategory::ZeroRated => "Z",
            TaxCategory::Exempt => "E",
            TaxCategory::OutOfScope => "O",
            TaxCategory::ReverseCharge => "AE",
        }
    }

    /// Lenient parse of the labels seen on documents ("SR", "ZR", "standard-rated", "E").
    pub fn parse(raw: &str) -> Option<Self> {
        let key: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "s" | "sr" | "standard" | "standardrated" => Some(TaxCategory::Standard),
            "z" | "zr" | "zero" | "zerorated" => Some(TaxCategory::ZeroRated),
            "e" | "es" | "es33" | "esn33" | "exempt" => Some(TaxCategory::Exempt),
            "o" | "os" | "outofscope" | "nt" => Some(TaxCategory::OutOfScope),
            "ae" | "rc" | "reversecharge" => Some(TaxCategory::ReverseCharge),
            _ => None,
        }
    }

    /// Categories that legitimately carry no tax.
    pub fn is_untaxed(&self) -> bool {
        !matches!(self, TaxCategory::Standard)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub amount: Decimal,
    /// Percent, e.g. 9 for 9%.
    pub tax_rate: Option<Decimal>,
    pub tax_category: Option<TaxCategory>,
}

impl LineItem {
    pub fn new(description: impl Into<String>, quantity: Decimal, unit_price: Decimal) -> Self {
        LineItem {
            description: description.into(),
            quantity,
            unit_price,
            amount: crate::models::round_money(quantity * unit_price),
            tax_rate: None,
            tax_category: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Party {
    pub name: Option<String>,
    pub uen: Option<String>,
    pub gst_registration_number: Option<String>,
    pub address: Option<String>,
}

impl Party {
    pub fn has_identifier(&self) -> bool {
        self.uen.is_some() || self.gst_registration_number.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractedFields {
    pub invoice_number: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub customer: Party,
    pub vendor: Party,
    pub subtotal: Option<Decimal>,
    pub tax_amount: Option<Decimal>,
    pub total_amount: Option<Decimal>,
    pub currency: Option<String>,
    pub line_items: Vec<LineItem>,
}

macro_rules! fill_field {
    ($filled:ident, $target:expr, $source:expr, $name:literal) => {
        if $target.is_none() && $source.is_some() {
            $target = $source.clone();
            $filled.push($name);
        }
    };
}

impl ExtractedFields {
    /// Copy every scalar field that is missing here but present in `other`.
    /// Returns the names of the fields that were filled.
    pub fn fill_missing_from(&mut self, other: &ExtractedFields) -> Vec<&'static str> {
        let mut filled = Vec::new();
        fill_field!(filled, self.invoice_number, other.invoice_number, "invoice_number");
        fill_field!(filled, self.invoice_date, other.invoice_date, "invoice_date");
        fill_field!(filled, self.due_date, other.due_date, "due_date");
        fill_field!(filled, self.customer.name, other.customer.name, "customer.name");
        fill_field!(filled, self.customer.uen, other.customer.uen, "customer.uen");
        fill_field!(filled, self.customer.address, other.customer.address, "customer.address");
        fill_field!(filled, self.vendor.name, other.vendor.name, "vendor.name");
        fill_field!(filled, self.vendor.uen, other.vendor.uen, "vendor.uen");
        fill_field!(
            filled,
            self.vendor.gst_registration_number,
            other.vendor.gst_registration_number,
            "vendor.gst_registration_number"
        );
        fill_field!(filled, self.vendor.address, other.vendor.address, "vendor.address");
        fill_field!(filled, self.subtotal, other.subtotal, "subtotal");
        fill_field!(filled, self.tax_amount, other.tax_amount, "tax_amount");
        fill_field!(filled, self.total_amount, other.total_amount, "total_amount");
        fill_field!(filled, self.currency, other.currency, "currency");
        filled
    }

    pub fn line_items_sum(&self) -> Option<Decimal> {
        if self.line_items.is_empty() {
            return None;
        }
        Some(self.line_items.iter().map(|item| item.amount).sum())
    }
}

/// Output of one extraction source, or of a merge across sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub fields: ExtractedFields,
    pub confidence: f64,
    pub source: String,
    pub duration_ms: u64,
    pub warnings: Vec<String>,
}

impl ExtractionResult {
    pub fn new(fields: ExtractedFields, confidence: f64, source: impl Into<String>, elapsed: Duration) -> Self {
        ExtractionResult {
            fields,
            confidence: confidence.clamp(0.0, 1.0),
            source: source.into(),
            duration_ms: elapsed.as_millis() as u64,
            warnings: Vec::new(),
        }
    }
}

/// Caller-supplied knobs for a single extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionOptions {
    pub preferred_provider: Option<String>,
    pub confidence_threshold: Option<f64>,
    /// Overrides the configured template-matching switch when set.
    pub use_templates: Option<bool>,
    /// Scopes vendor backfill to this owner's prior invoices.
    pub owner_id: Option<Uuid>,
    /// Declared media type; inferred from the file name when absent.
    pub media_type: Option<super::MediaType>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_missing_keeps_existing_values() {
        let mut base = ExtractedFields {
            invoice_number: Some("INV-001".into()),
            ..Default::default()
        };
        let other = ExtractedFields {
            invoice_number: Some("INV-002".into()),
            currency: Some("SGD".into()),
            subtotal: Some(Decimal::new(1000, 0)),
            ..Default::default()
        };

        let filled = base.fill_missing_from(&other);

        assert_eq!(base.invoice_number.as_deref(), Some("INV-001"));
        assert_eq!(base.currency.as_deref(), Some("SGD"));
        assert_eq!(filled, vec!["subtotal", "currency"]);
    }

    #[test]
    fn test_tax_category_parse() {
        assert_eq!(TaxCategory::parse("SR"), Some(TaxCategory::Standard));
        assert_eq!(TaxCategory::parse("zero-rated"), Some(TaxCategory::ZeroRated));
        assert_eq!(TaxCategory::parse("Exempt"), Some(TaxCategory::Exempt));
        assert_eq!(TaxCategory::parse("??"), None);
    }
}
