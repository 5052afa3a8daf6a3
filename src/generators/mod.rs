//! Outbound document generation.

pub mod ubl;

use crate::core::GenerationError;
use crate::models::Invoice;

pub use ubl::UblGenerator;

/// Renders a validated invoice into an interchange document.
pub trait DocumentGenerator: Send + Sync {
    fn content_type(&self) -> &'static str;

    fn generate(&self, invoice: &Invoice) -> Result<Vec<u8>, GenerationError>;
}
