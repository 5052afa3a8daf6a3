//! Local adapter for XLSX/XLS invoices.

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::ExtractionProvider;
use crate::core::ProviderError;
use crate::extraction::parse::{clean_text, parse_amount, parse_date, parse_rate};
use crate::extraction::text::spreadsheet_rows;
use crate::jurisdiction::GstRateTable;
use crate::models::{round_money, ExtractedFields, LineItem, MediaType, TaxCategory};

const ID: &str = "spreadsheet";

pub struct SpreadsheetProvider {
    rates: GstRateTable,
}

impl SpreadsheetProvider {
    pub fn new(rates: GstRateTable) -> Self {
        SpreadsheetProvider { rates }
    }
}

#[async_trait]
impl ExtractionProvider for SpreadsheetProvider {
    fn id(&self) -> &str {
        ID
    }

    fn supports(&self, media: MediaType) -> bool {
        media.is_spreadsheet()
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn extract(&self, bytes: &[u8], _file_name: &str, media: MediaType) -> Result<ExtractedFields, ProviderError> {
        if !self.supports(media) {
            return Err(ProviderError::Unsupported {
                provider: ID.to_string(),
                mime_type: media.mime().to_string(),
            });
        }
        let rows = spreadsheet_rows(bytes).map_err(|e| ProviderError::parse(ID, e))?;
        Ok(parse_rows(&rows, &self.rates))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    InvoiceNumber,
    InvoiceDate,
    DueDate,
    Customer,
    CustomerUen,
    Vendor,
    VendorUen,
    GstNumber,
    Subtotal,
    Tax,
    Total,
    Currency,
}

fn normalize_label(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn label_of(raw: &str) -> Option<Label> {
    let key = normalize_label(raw);
    let label = match key.as_str() {
        "invoice no" | "invoice number" | "invoice" | "inv no" | "invoice ref" => Label::InvoiceNumber,
        "date" | "invoice date" | "date of issue" | "issue date" => Label::InvoiceDate,
        "due date" | "payment due" | "due" => Label::DueDate,
        "bill to" | "billed to" | "customer" | "customer name" | "sold to" => Label::Customer,
        "customer uen" | "bill to uen" => Label::CustomerUen,
        "vendor" | "supplier" | "from" | "company" | "seller" => Label::Vendor,
        "uen" | "vendor uen" | "supplier uen" | "company uen" => Label::VendorUen,
        "subtotal" | "sub total" | "total before gst" | "net amount" => Label::Subtotal,
        "total" | "grand total" | "total amount" | "amount due" | "total due" | "total payable" => Label::Total,
        "currency" => Label::Currency,
        k if k.starts_with("gst reg") || k == "gst no" || k == "gst registration number" => Label::GstNumber,
        k if k.starts_with("gst") || k.starts_with("tax") => Label::Tax,
        _ => return None,
    };
    Some(label)
}

/// Column positions of the line-item table.
#[derive(Debug, Default)]
struct Columns {
    description: Option<usize>,
    quantity: Option<usize>,
    unit_price: Option<usize>,
    amount: Option<usize>,
    tax_rate: Option<usize>,
    tax_category: Option<usize>,
}

impl Columns {
    fn detect(row: &[String]) -> Option<Self> {
        let mut cols = Columns::default();
        for (i, cell) in row.iter().enumerate() {
            let key = normalize_label(cell);
            if key.is_empty() {
                continue;
            }
            if ["description", "item", "items", "particulars", "service", "details"].contains(&key.as_str()) {
                cols.description.get_or_insert(i);
            } else if key == "qty" || key.starts_with("quantity") {
                cols.quantity.get_or_insert(i);
            } else if key.contains("code") || key.contains("category") {
                cols.tax_category.get_or_insert(i);
            } else if key.contains("gst") || key.contains("tax") {
                cols.tax_rate.get_or_insert(i);
            } else if key.contains("price") || key == "rate" || key == "unit cost" {
                cols.unit_price.get_or_insert(i);
            } else if key.contains("amount") || key == "total" || key == "line total" {
                cols.amount.get_or_insert(i);
            }
        }
        let is_header = cols.description.is_some() && (cols.amount.is_some() || cols.quantity.is_some());
        is_header.then_some(cols)
    }

    fn item(&self, row: &[String]) -> Option<LineItem> {
        let cell = |idx: Option<usize>| idx.and_then(|i| row.get(i)).map(String::as_str).unwrap_or("");

        let description = clean_text(cell(self.description))?;
        let quantity = parse_amount(cell(self.quantity));
        let unit_price = parse_amount(cell(self.unit_price));
        let amount = parse_amount(cell(self.amount));

        let (quantity, unit_price, amount) = match (quantity, unit_price, amount) {
            (q, Some(p), Some(a)) => (q.unwrap_or(Decimal::ONE), p, a),
            (q, Some(p), None) => {
                let q = q.unwrap_or(Decimal::ONE);
                (q, p, round_money(q * p))
            }
            (Some(q), None, Some(a)) if !q.is_zero() => (q, round_money(a / q), a),
            (_, None, Some(a)) => (Decimal::ONE, a, a),
            _ => return None,
        };

        Some(LineItem {
            description,
            quantity,
            unit_price,
            amount,
            tax_rate: parse_rate(cell(self.tax_rate)),
            tax_category: TaxCategory::parse(cell(self.tax_category)),
        })
    }
}

fn is_blank(row: &[String]) -> bool {
    row.iter().all(|c| c.trim().is_empty())
}

/// Value for a label cell: the text after a colon in the same cell, else the next non-empty cell to the right.
fn labelled_value(row: &[String], idx: usize) -> Option<String> {
    if let Some((_, rest)) = row[idx].split_once(':') {
        if let Some(value) = clean_text(rest) {
            return Some(value);
        }
    }
    row.iter().skip(idx + 1).find_map(|c| clean_text(c))
}

fn cell_label(cell: &str) -> Option<Label> {
    let head = cell.split_once(':').map(|(h, _)| h).unwrap_or(cell);
    label_of(head)
}

fn apply_label(fields: &mut ExtractedFields, label: Label, value: String) {
    match label {
        Label::InvoiceNumber => {
            fields.invoice_number.get_or_insert(value);
        }
        Label::InvoiceDate => fields.invoice_date = fields.invoice_date.or_else(|| parse_date(&value)),
        Label::DueDate => fields.due_date = fields.due_date.or_else(|| parse_date(&value)),
        Label::Customer => {
            fields.customer.name.get_or_insert(value);
        }
        Label::CustomerUen => {
            fields.customer.uen.get_or_insert(value);
        }
        Label::Vendor => {
            fields.vendor.name.get_or_insert(value);
        }
        Label::VendorUen => {
            fields.vendor.uen.get_or_insert(value);
        }
        Label::GstNumber => {
            fields.vendor.gst_registration_number.get_or_insert(value);
        }
        Label::Subtotal => fields.subtotal = fields.subtotal.or_else(|| parse_amount(&value)),
        Label::Tax => fields.tax_amount = fields.tax_amount.or_else(|| parse_amount(&value)),
        Label::Total => fields.total_amount = fields.total_amount.or_else(|| parse_amount(&value)),
        Label::Currency => {
            fields.currency.get_or_insert(value.to_ascii_uppercase());
        }
    }
}

/// Read an invoice laid out as labelled cells around a line-item table.
pub fn parse_rows(rows: &[Vec<String>], rates: &GstRateTable) -> ExtractedFields {
    let mut fields = ExtractedFields::default();

    let header = rows.iter().enumerate().find_map(|(i, row)| Columns::detect(row).map(|c| (i, c)));
    let mut table_rows = 0..0;

    if let Some((header_idx, columns)) = &header {
        let start = header_idx + 1;
        let mut end = start;
        for row in rows.iter().skip(start) {
            if is_blank(row) || row.iter().any(|c| cell_label(c).is_some()) {
                break;
            }
            if let Some(item) = columns.item(row) {
                fields.line_items.push(item);
            }
            end += 1;
        }
        table_rows = *header_idx..end;
    }

    for (i, row) in rows.iter().enumerate() {
        if table_rows.contains(&i) {
            continue;
        }
        for (idx, cell) in row.iter().enumerate() {
            if let Some(label) = cell_label(cell) {
                if let Some(value) = labelled_value(row, idx) {
                    apply_label(&mut fields, label, value);
                }
                break;
            }
        }
    }

    fill_totals(&mut fields, rates);
    fields
}

fn fill_totals(fields: &mut ExtractedFields, rates: &GstRateTable) {
    if fields.subtotal.is_none() {
        fields.subtotal = fields.line_items_sum().map(round_money);
    }
    let Some(subtotal) = fields.subtotal else {
        return;
    };
    if fields.tax_amount.is_none() {
        let (rate, _) = rates.effective(fields.invoice_date);
        fields.tax_amount = Some(rates.tax_for(subtotal, rate));
    }
    if fields.total_amount.is_none() {
        fields.total_amount = fields.tax_amount.map(|tax| subtotal + tax);
    }
}
