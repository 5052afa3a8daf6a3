use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{ExtractedFields, LineItem, Party};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Processing,
    Submitted,
    Delivered,
    Failed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Processing => "processing",
            InvoiceStatus::Submitted => "submitted",
            InvoiceStatus::Delivered => "delivered",
            InvoiceStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "draft" => Some(InvoiceStatus::Draft),
            "processing" => Some(InvoiceStatus::Processing),
            "submitted" => Some(InvoiceStatus::Submitted),
            "delivered" => Some(InvoiceStatus::Delivered),
            "failed" => Some(InvoiceStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Special GST schemes with their own rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialScheme {
    TouristRefund,
    DigitalPaymentToken,
}

/// Invoice content as seen by the validation engine and the document generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub owner_id: Uuid,
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub invoice_date: Option<NaiveDate>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub payment_terms_days: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub customer: Party,
    #[serde(default)]
    pub vendor: Party,
    #[serde(default)]
    pub subtotal: Option<Decimal>,
    #[serde(default)]
    pub tax_amount: Option<Decimal>,
    #[serde(default)]
    pub total_amount: Option<Decimal>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub peppol_participant_id: Option<String>,
    #[serde(default)]
    pub special_scheme: Option<SpecialScheme>,
}

impl Invoice {
    pub fn new(id: Uuid, owner_id: Uuid) -> Self {
        Invoice {
            id,
            owner_id,
            invoice_number: None,
            invoice_date: None,
            due_date: None,
            payment_terms_days: None,
            currency: None,
            customer: Party::default(),
            vendor: Party::default(),
            subtotal: None,
            tax_amount: None,
            total_amount: None,
            line_items: Vec::new(),
            peppol_participant_id: None,
            special_scheme: None,
        }
    }

    /// Overwrite the extractable fields with an extraction result's fields.
    pub fn apply_extraction(&mut self, fields: &ExtractedFields) {
        self.invoice_number = fields.invoice_number.clone();
        self.invoice_date = fields.invoice_date;
        self.due_date = fields.due_date;
        self.currency = fields.currency.clone();
        self.customer = fields.customer.clone();
        self.vendor = fields.vendor.clone();
        self.subtotal = fields.subtotal;
        self.tax_amount = fields.tax_amount;
        self.total_amount = fields.total_amount;
        self.line_items = fields.line_items.clone();
        if let (Some(date), Some(due)) = (self.invoice_date, self.due_date) {
            self.payment_terms_days = Some((due - date).num_days());
        }
    }

    pub fn to_fields(&self) -> ExtractedFields {
        ExtractedFields {
            invoice_number: self.invoice_number.clone(),
            invoice_date: self.invoice_date,
            due_date: self.due_date,
            customer: self.customer.clone(),
            vendor: self.vendor.clone(),
            subtotal: self.subtotal,
            tax_amount: self.tax_amount,
            total_amount: self.total_amount,
            currency: self.currency.clone(),
            line_items: self.line_items.clone(),
        }
    }
}

/// Persisted invoice row plus processing bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub invoice: Invoice,
    pub status: InvoiceStatus,
    pub error_message: Option<String>,
    pub source_document_key: Option<String>,
    pub generated_document_url: Option<String>,
    pub ocr_confidence: Option<f64>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InvoiceRecord {
    pub fn new(invoice: Invoice, status: InvoiceStatus) -> Self {
        let now = Utc::now();
        InvoiceRecord {
            invoice,
            status,
            error_message: None,
            source_document_key: None,
            generated_document_url: None,
            ocr_confidence: None,
            processing_started_at: None,
            processing_completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> Uuid {
        self.invoice.id
    }

    pub fn owner_id(&self) -> Uuid {
        self.invoice.owner_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub job_id: Uuid,
    pub invoice_id: Uuid,
    pub action: String,
    pub status: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ProcessingLogEntry {
    pub fn new(job_id: Uuid, invoice_id: Uuid, action: &str, status: &str, detail: serde_json::Value) -> Self {
        ProcessingLogEntry {
            job_id,
            invoice_id,
            action: action.to_string(),
            status: status.to_string(),
            detail,
            created_at: Utc::now(),
        }
    }
}
