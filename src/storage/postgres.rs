use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use super::memory::vendor_prefix;
use super::{InvoiceLookup, RecordStore, TemplateRepository, VendorDirectory};
use crate::core::{DatabaseConfig, StorageError, StorageResult};
use crate::models::{
    FieldPattern, Invoice, InvoiceRecord, InvoiceStatus, LineItem, Party, ProcessingLogEntry, Template,
};

/// Record store backed by the tables in `migrations/`.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn connect(config: &DatabaseConfig) -> StorageResult<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| StorageError::Backend("database.url is not set".to_string()))?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await?;
        Ok(PgRecordStore { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PgRecordStore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StorageResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    pub async fn ping(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn load_line_items(&self, invoice_id: Uuid) -> StorageResult<Vec<LineItem>> {
        let rows = sqlx::query(
            r#"
            SELECT description, quantity, unit_price, amount, tax_category, tax_rate
            FROM invoice_line_items
            WHERE invoice_id = $1
            ORDER BY line_number
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StorageResult<LineItem> {
                Ok(LineItem {
                    description: row.try_get("description")?,
                    quantity: row.try_get("quantity")?,
                    unit_price: row.try_get("unit_price")?,
                    amount: row.try_get("amount")?,
                    tax_category: decode_enum(row.try_get("tax_category")?),
                    tax_rate: row.try_get("tax_rate")?,
                })
            })
            .collect()
    }
}

/// Enums are stored as their snake_case serde names.
fn encode_enum<T: Serialize>(value: Option<T>) -> Option<String> {
    value
        .and_then(|v| serde_json::to_value(v).ok())
        .and_then(|v| v.as_str().map(str::to_string))
}

fn decode_enum<T: DeserializeOwned>(raw: Option<String>) -> Option<T> {
    raw.and_then(|s| serde_json::from_value(serde_json::Value::String(s)).ok())
}

fn party(row: &PgRow, prefix: &str) -> Result<Party, sqlx::Error> {
    Ok(Party {
        name: row.try_get(format!("{}_name", prefix).as_str())?,
        uen: row.try_get(format!("{}_uen", prefix).as_str())?,
        gst_registration_number: row.try_get(format!("{}_gst_number", prefix).as_str())?,
        address: row.try_get(format!("{}_address", prefix).as_str())?,
    })
}

fn invoice_record(row: &PgRow) -> StorageResult<InvoiceRecord> {
    let status: String = row.try_get("status")?;
    let status = InvoiceStatus::parse(&status)
        .ok_or_else(|| StorageError::Backend(format!("unknown invoice status '{}'", status)))?;

    let invoice = Invoice {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        invoice_number: row.try_get("invoice_number")?,
        invoice_date: row.try_get("invoice_date")?,
        due_date: row.try_get("due_date")?,
        payment_terms_days: row.try_get("payment_terms_days")?,
        currency: row.try_get("currency")?,
        customer: party(row, "customer")?,
        vendor: party(row, "vendor")?,
        subtotal: row.try_get("subtotal")?,
        tax_amount: row.try_get("tax_amount")?,
        total_amount: row.try_get("total_amount")?,
        line_items: Vec::new(),
        peppol_participant_id: row.try_get("peppol_participant_id")?,
        special_scheme: decode_enum(row.try_get("special_scheme")?),
    };

    Ok(InvoiceRecord {
        invoice,
        status,
        error_message: row.try_get("error_message")?,
        source_document_key: row.try_get("source_document_key")?,
        generated_document_url: row.try_get("generated_document_url")?,
        ocr_confidence: row.try_get("ocr_confidence")?,
        processing_started_at: row.try_get("processing_started_at")?,
        processing_completed_at: row.try_get("processing_completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn template(row: &PgRow) -> StorageResult<Template> {
    let patterns: serde_json::Value = row.try_get("patterns")?;
    let patterns: Vec<FieldPattern> =
        serde_json::from_value(patterns).map_err(|e| StorageError::Backend(format!("template patterns: {}", e)))?;
    let usage_count: i64 = row.try_get("usage_count")?;
    Ok(Template {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        bound_party: row.try_get("bound_party")?,
        patterns,
        confidence_prior: row.try_get("confidence_prior")?,
        usage_count: usage_count.max(0) as u64,
        last_used_at: row.try_get("last_used_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn create_invoice(&self, record: &InvoiceRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO invoices (id, owner_id, status, invoice_number, source_document_key, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id())
        .bind(record.owner_id())
        .bind(record.status.as_str())
        .bind(&record.invoice.invoice_number)
        .bind(&record.source_document_key)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        self.update_invoice(record).await
    }

    async fn get_invoice(&self, id: Uuid) -> StorageResult<InvoiceRecord> {
        let row = sqlx::query("SELECT * FROM invoices WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("invoice {}", id)))?;
        let mut record = invoice_record(&row)?;
        record.invoice.line_items = self.load_line_items(id).await?;
        Ok(record)
    }

    async fn update_invoice(&self, record: &InvoiceRecord) -> StorageResult<()> {
        let inv = &record.invoice;
        let result = sqlx::query(
            r#"
            UPDATE invoices SET
                status = $2, invoice_number = $3, invoice_date = $4, due_date = $5,
                payment_terms_days = $6, currency = $7,
                customer_name = $8, customer_uen = $9, customer_gst_number = $10, customer_address = $11,
                vendor_name = $12, vendor_uen = $13, vendor_gst_number = $14, vendor_address = $15,
                subtotal = $16, tax_amount = $17, total_amount = $18,
                peppol_participant_id = $19, special_scheme = $20,
                error_message = $21, source_document_key = $22, generated_document_url = $23,
                ocr_confidence = $24, processing_started_at = $25, processing_completed_at = $26,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(inv.id)
        .bind(record.status.as_str())
        .bind(&inv.invoice_number)
        .bind(inv.invoice_date)
        .bind(inv.due_date)
        .bind(inv.payment_terms_days)
        .bind(&inv.currency)
        .bind(&inv.customer.name)
        .bind(&inv.customer.uen)
        .bind(&inv.customer.gst_registration_number)
        .bind(&inv.customer.address)
        .bind(&inv.vendor.name)
        .bind(&inv.vendor.uen)
        .bind(&inv.vendor.gst_registration_number)
        .bind(&inv.vendor.address)
        .bind(inv.subtotal)
        .bind(inv.tax_amount)
        .bind(inv.total_amount)
        .bind(&inv.peppol_participant_id)
        .bind(encode_enum(inv.special_scheme))
        .bind(&record.error_message)
        .bind(&record.source_document_key)
        .bind(&record.generated_document_url)
        .bind(record.ocr_confidence)
        .bind(record.processing_started_at)
        .bind(record.processing_completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("invoice {}", inv.id)));
        }
        Ok(())
    }

    async fn replace_line_items(&self, invoice_id: Uuid, items: &[LineItem]) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM invoice_line_items WHERE invoice_id = $1")
            .bind(invoice_id)
            .execute(&mut *tx)
            .await?;
        for (i, item) in items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO invoice_line_items
                    (invoice_id, line_number, description, quantity, unit_price, amount, tax_category, tax_rate)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(invoice_id)
            .bind(i as i32 + 1)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.amount)
            .bind(encode_enum(item.tax_category))
            .bind(item.tax_rate)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn append_log(&self, entry: &ProcessingLogEntry) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO processing_logs (job_id, invoice_id, action, status, detail, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.job_id)
        .bind(entry.invoice_id)
        .bind(&entry.action)
        .bind(&entry.status)
        .bind(&entry.detail)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_invoices_since(&self, owner: Uuid, since: DateTime<Utc>) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM invoices WHERE owner_id = $1 AND created_at >= $2")
            .bind(owner)
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn owner_plan(&self, owner: Uuid) -> StorageResult<Option<String>> {
        let plan = sqlx::query_scalar("SELECT plan FROM owner_plans WHERE owner_id = $1")
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;
        Ok(plan)
    }
}

#[async_trait]
impl InvoiceLookup for PgRecordStore {
    async fn invoice_number_exists(&self, owner: Uuid, number: &str, exclude: Option<Uuid>) -> StorageResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM invoices
                WHERE owner_id = $1 AND TRIM(invoice_number) = $2 AND ($3::uuid IS NULL OR id <> $3)
            )
            "#,
        )
        .bind(owner)
        .bind(number)
        .bind(exclude)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

#[async_trait]
impl VendorDirectory for PgRecordStore {
    async fn find_vendors(&self, owner: Option<Uuid>, name: Option<&str>, uen: Option<&str>) -> StorageResult<Vec<Party>> {
        let prefix = name.map(vendor_prefix).filter(|p| !p.is_empty());
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT vendor_name, vendor_uen, vendor_gst_number, vendor_address
            FROM invoices
            WHERE ($1::uuid IS NULL OR owner_id = $1)
              AND vendor_name IS NOT NULL
              AND (
                ($2::text IS NOT NULL AND vendor_uen = $2)
                OR ($3::text IS NOT NULL AND LOWER(REGEXP_REPLACE(vendor_name, '[^[:alnum:]]', '', 'g')) LIKE $3 || '%')
              )
            LIMIT 20
            "#,
        )
        .bind(owner)
        .bind(uen)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| party(row, "vendor").map_err(StorageError::from))
            .collect()
    }
}

#[async_trait]
impl TemplateRepository for PgRecordStore {
    async fn load_templates(&self, limit: usize) -> StorageResult<Vec<Template>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM templates
            ORDER BY usage_count DESC, last_used_at DESC NULLS LAST
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(template).collect()
    }

    async fn save_template(&self, t: &Template) -> StorageResult<()> {
        let patterns = serde_json::to_value(&t.patterns).map_err(|e| StorageError::Backend(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO templates (id, name, bound_party, patterns, confidence_prior, usage_count, last_used_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                bound_party = EXCLUDED.bound_party,
                patterns = EXCLUDED.patterns,
                confidence_prior = EXCLUDED.confidence_prior
            "#,
        )
        .bind(t.id)
        .bind(&t.name)
        .bind(&t.bound_party)
        .bind(patterns)
        .bind(t.confidence_prior)
        .bind(t.usage_count as i64)
        .bind(t.last_used_at)
        .bind(t.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_usage(&self, id: Uuid, usage_count: u64, used_at: DateTime<Utc>) -> StorageResult<()> {
        sqlx::query("UPDATE templates SET usage_count = $2, last_used_at = $3 WHERE id = $1")
            .bind(id)
            .bind(usage_count as i64)
            .bind(used_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SpecialScheme, TaxCategory};

    #[test]
    fn test_enums_round_trip_through_text_columns() {
        assert_eq!(encode_enum(Some(TaxCategory::ZeroRated)).as_deref(), Some("zero_rated"));
        assert_eq!(decode_enum::<TaxCategory>(Some("zero_rated".into())), Some(TaxCategory::ZeroRated));
        assert_eq!(
            decode_enum::<SpecialScheme>(encode_enum(Some(SpecialScheme::DigitalPaymentToken))),
            Some(SpecialScheme::DigitalPaymentToken)
        );
        assert_eq!(decode_enum::<TaxCategory>(Some("bogus".into())), None);
        assert_eq!(encode_enum::<TaxCategory>(None), None);
    }
}
