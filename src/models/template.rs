use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Fields a template pattern can populate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateField {
    InvoiceNumber,
    InvoiceDate,
    DueDate,
    CustomerName,
    CustomerUen,
    CustomerAddress,
    VendorName,
    VendorUen,
    VendorGstNumber,
    VendorAddress,
    Subtotal,
    TaxAmount,
    TotalAmount,
    Currency,
}

impl TemplateField {
    pub fn is_amount(&self) -> bool {
        matches!(self, TemplateField::Subtotal | TemplateField::TaxAmount | TemplateField::TotalAmount)
    }

    pub fn is_date(&self) -> bool {
        matches!(self, TemplateField::InvoiceDate | TemplateField::DueDate)
    }
}

impl fmt::Display for TemplateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&name)
    }
}

/// Regex with one capture group holding the field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldPattern {
    pub field: TemplateField,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub name: String,
    /// Vendor or customer identifier (UEN or name) the layout belongs to.
    pub bound_party: Option<String>,
    pub patterns: Vec<FieldPattern>,
    pub confidence_prior: f64,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Template {
    pub fn new(name: impl Into<String>, bound_party: Option<String>, patterns: Vec<FieldPattern>, confidence_prior: f64) -> Self {
        Template {
            id: Uuid::new_v4(),
            name: name.into(),
            bound_party,
            patterns,
            confidence_prior: confidence_prior.clamp(0.0, 1.0),
            usage_count: 0,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }
}
