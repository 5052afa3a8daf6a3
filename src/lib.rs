//! Invoice intelligence: extraction from uploaded documents, Singapore GST compliance checks,
//! and an asynchronous job pipeline that produces InvoiceNow (Peppol UBL) documents.

pub mod api;
pub mod cache;
pub mod core;
pub mod extraction;
pub mod generators;
pub mod jurisdiction;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod providers;
pub mod storage;
pub mod templates;
pub mod validation;

pub use crate::core::{PipelineError, Settings};
pub use extraction::ExtractionOrchestrator;
pub use pipeline::{Pipeline, PipelineDeps};
pub use validation::ValidationEngine;
