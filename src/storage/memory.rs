//! In-process stores for tests and single-node runs without Postgres or S3.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{BlobStore, InvoiceLookup, RecordStore, TemplateRepository, VendorDirectory};
use crate::core::{StorageError, StorageResult};
use crate::models::{InvoiceRecord, LineItem, Party, ProcessingLogEntry, Template};

/// Characters of a vendor name used to pick backfill candidates.
pub(crate) const VENDOR_PREFIX_LEN: usize = 3;

pub(crate) fn vendor_prefix(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .take(VENDOR_PREFIX_LEN)
        .collect::<String>()
        .to_lowercase()
}

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: DashMap<String, (Vec<u8>, String)>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.get(key).map(|o| o.1.clone())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> StorageResult<String> {
        self.objects.insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(format!("memory://{}", key))
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.objects
            .get(key)
            .map(|o| o.0.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects.remove(key);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRecordStore {
    invoices: DashMap<Uuid, InvoiceRecord>,
    line_items: DashMap<Uuid, Vec<LineItem>>,
    logs: Mutex<Vec<ProcessingLogEntry>>,
    plans: DashMap<Uuid, String>,
    templates: DashMap<Uuid, Template>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_plan(&self, owner: Uuid, plan: impl Into<String>) {
        self.plans.insert(owner, plan.into());
    }

    pub fn logs_for(&self, job_id: Uuid) -> Vec<ProcessingLogEntry> {
        self.logs.lock().iter().filter(|e| e.job_id == job_id).cloned().collect()
    }

    pub fn line_items(&self, invoice_id: Uuid) -> Vec<LineItem> {
        self.line_items.get(&invoice_id).map(|l| l.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create_invoice(&self, record: &InvoiceRecord) -> StorageResult<()> {
        self.invoices.insert(record.id(), record.clone());
        Ok(())
    }

    async fn get_invoice(&self, id: Uuid) -> StorageResult<InvoiceRecord> {
        let mut record = self
            .invoices
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| StorageError::NotFound(format!("invoice {}", id)))?;
        if let Some(items) = self.line_items.get(&id) {
            record.invoice.line_items = items.clone();
        }
        Ok(record)
    }

    async fn update_invoice(&self, record: &InvoiceRecord) -> StorageResult<()> {
        match self.invoices.get_mut(&record.id()) {
            Some(mut existing) => {
                *existing = record.clone();
                existing.updated_at = Utc::now();
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("invoice {}", record.id()))),
        }
    }

    async fn replace_line_items(&self, invoice_id: Uuid, items: &[LineItem]) -> StorageResult<()> {
        self.line_items.insert(invoice_id, items.to_vec());
        Ok(())
    }

    async fn append_log(&self, entry: &ProcessingLogEntry) -> StorageResult<()> {
        self.logs.lock().push(entry.clone());
        Ok(())
    }

    async fn count_invoices_since(&self, owner: Uuid, since: DateTime<Utc>) -> StorageResult<u64> {
        Ok(self
            .invoices
            .iter()
            .filter(|r| r.owner_id() == owner && r.created_at >= since)
            .count() as u64)
    }

    async fn owner_plan(&self, owner: Uuid) -> StorageResult<Option<String>> {
        Ok(self.plans.get(&owner).map(|p| p.clone()))
    }
}

#[async_trait]
impl InvoiceLookup for MemoryRecordStore {
    async fn invoice_number_exists(&self, owner: Uuid, number: &str, exclude: Option<Uuid>) -> StorageResult<bool> {
        Ok(self.invoices.iter().any(|r| {
            r.owner_id() == owner
                && Some(r.id()) != exclude
                && r.invoice.invoice_number.as_deref().map(str::trim) == Some(number)
        }))
    }
}

#[async_trait]
impl VendorDirectory for MemoryRecordStore {
    async fn find_vendors(&self, owner: Option<Uuid>, name: Option<&str>, uen: Option<&str>) -> StorageResult<Vec<Party>> {
        let prefix = name.map(vendor_prefix).filter(|p| !p.is_empty());
        let mut found: Vec<Party> = Vec::new();
        for record in self.invoices.iter() {
            if owner.map(|o| o != record.owner_id()).unwrap_or(false) {
                continue;
            }
            let vendor = &record.invoice.vendor;
            let by_uen = uen.is_some() && vendor.uen.as_deref() == uen;
            let by_name = match (&prefix, vendor.name.as_deref()) {
                (Some(prefix), Some(candidate)) => vendor_prefix(candidate) == *prefix,
                _ => false,
            };
            if (by_uen || by_name) && !found.contains(vendor) {
                found.push(vendor.clone());
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl TemplateRepository for MemoryRecordStore {
    async fn load_templates(&self, limit: usize) -> StorageResult<Vec<Template>> {
        let mut all: Vec<Template> = self.templates.iter().map(|t| t.clone()).collect();
        all.sort_by(|a, b| {
            b.usage_count
                .cmp(&a.usage_count)
                .then_with(|| b.last_used_at.cmp(&a.last_used_at))
        });
        all.truncate(limit);
        Ok(all)
    }

    async fn save_template(&self, template: &Template) -> StorageResult<()> {
        self.templates.insert(template.id, template.clone());
        Ok(())
    }

    async fn record_usage(&self, id: Uuid, usage_count: u64, used_at: DateTime<Utc>) -> StorageResult<()> {
        let mut template = self
            .templates
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("template {}", id)))?;
        template.usage_count = usage_count;
        template.last_used_at = Some(used_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Invoice, InvoiceStatus};
    use pretty_assertions::assert_eq;

    fn record(owner: Uuid, number: &str, vendor: &str, uen: &str) -> InvoiceRecord {
        let mut invoice = Invoice::new(Uuid::new_v4(), owner);
        invoice.invoice_number = Some(number.to_string());
        invoice.vendor.name = Some(vendor.to_string());
        invoice.vendor.uen = Some(uen.to_string());
        InvoiceRecord::new(invoice, InvoiceStatus::Draft)
    }

    #[tokio::test]
    async fn test_invoice_number_lookup_is_owner_scoped() {
        let store = MemoryRecordStore::new();
        let owner = Uuid::new_v4();
        let existing = record(owner, "INV-1", "Acme Pte Ltd", "201912345A");
        store.create_invoice(&existing).await.unwrap();

        assert!(store.invoice_number_exists(owner, "INV-1", None).await.unwrap());
        assert!(!store.invoice_number_exists(owner, "INV-1", Some(existing.id())).await.unwrap());
        assert!(!store.invoice_number_exists(Uuid::new_v4(), "INV-1", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_vendors_by_uen_or_name_prefix() {
        let store = MemoryRecordStore::new();
        let owner = Uuid::new_v4();
        store.create_invoice(&record(owner, "1", "Acme Pte Ltd", "201912345A")).await.unwrap();
        store.create_invoice(&record(owner, "2", "Acme Pte Ltd", "201912345A")).await.unwrap();
        store.create_invoice(&record(owner, "3", "Zenith LLP", "53123456B")).await.unwrap();

        let by_name = store.find_vendors(Some(owner), Some("ACME pte. ltd"), None).await.unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].uen.as_deref(), Some("201912345A"));

        let by_uen = store.find_vendors(None, None, Some("53123456B")).await.unwrap();
        assert_eq!(by_uen[0].name.as_deref(), Some("Zenith LLP"));
    }

    #[tokio::test]
    async fn test_line_items_are_returned_with_invoice() {
        let store = MemoryRecordStore::new();
        let rec = record(Uuid::new_v4(), "1", "Acme", "201912345A");
        store.create_invoice(&rec).await.unwrap();
        let items = vec![LineItem::new("Widget", 2.into(), 5.into())];

        store.replace_line_items(rec.id(), &items).await.unwrap();

        assert_eq!(store.get_invoice(rec.id()).await.unwrap().invoice.line_items, items);
    }
}
