//! Collaborator interfaces: blob storage and the relational record store.

pub mod memory;
pub mod postgres;
pub mod s3;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core::StorageResult;
use crate::models::{InvoiceRecord, LineItem, Party, ProcessingLogEntry, Template};

pub use self::memory::{MemoryBlobStore, MemoryRecordStore};
pub use self::postgres::PgRecordStore;
pub use self::s3::S3BlobStore;

/// Get/put-by-key document storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key` and return the public URL.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> StorageResult<String>;

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    async fn delete(&self, key: &str) -> StorageResult<()>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_invoice(&self, record: &InvoiceRecord) -> StorageResult<()>;

    async fn get_invoice(&self, id: Uuid) -> StorageResult<InvoiceRecord>;

    async fn update_invoice(&self, record: &InvoiceRecord) -> StorageResult<()>;

    async fn replace_line_items(&self, invoice_id: Uuid, items: &[LineItem]) -> StorageResult<()>;

    async fn append_log(&self, entry: &ProcessingLogEntry) -> StorageResult<()>;

    /// Invoices created by `owner` at or after `since`.
    async fn count_invoices_since(&self, owner: Uuid, since: DateTime<Utc>) -> StorageResult<u64>;

    async fn owner_plan(&self, owner: Uuid) -> StorageResult<Option<String>>;
}

/// Duplicate invoice-number lookup used by validation.
#[async_trait]
pub trait InvoiceLookup: Send + Sync {
    async fn invoice_number_exists(&self, owner: Uuid, number: &str, exclude: Option<Uuid>) -> StorageResult<bool>;
}

/// Vendor identities seen on prior invoices.
#[async_trait]
pub trait VendorDirectory: Send + Sync {
    /// Candidate vendors whose UEN equals `uen` or whose name shares a prefix with `name`.
    async fn find_vendors(&self, owner: Option<Uuid>, name: Option<&str>, uen: Option<&str>) -> StorageResult<Vec<Party>>;
}

#[async_trait]
pub trait TemplateRepository: Send + Sync {
    /// Templates ranked by usage count, then most recent use.
    async fn load_templates(&self, limit: usize) -> StorageResult<Vec<Template>>;

    async fn save_template(&self, template: &Template) -> StorageResult<()>;

    async fn record_usage(&self, id: Uuid, usage_count: u64, used_at: DateTime<Utc>) -> StorageResult<()>;
}

pub fn source_document_key(owner: Uuid, invoice: Uuid, file_name: &str) -> String {
    format!("invoices/{}/{}/source/{}", owner, invoice, sanitize_file_name(file_name))
}

pub fn generated_document_key(owner: Uuid, invoice: Uuid) -> String {
    format!("invoices/{}/{}/generated/invoice.xml", owner, invoice)
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
