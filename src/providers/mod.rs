//! Extraction provider adapters and the registry that builds them from configuration.

pub mod document_intelligence;
pub mod spreadsheet;
pub mod vision;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{ProviderConfig, ProviderError};
use crate::extraction::parse::{clean_text, parse_amount, parse_date};
use crate::extraction::scoring::score_fields;
use crate::jurisdiction::GstRateTable;
use crate::models::{ExtractedFields, MediaType};

pub use self::document_intelligence::DocumentIntelligenceProvider;
pub use self::spreadsheet::SpreadsheetProvider;
pub use self::vision::{VisionFlavour, VisionProvider};

/// One extraction source. Implementations are selected from configuration at startup.
#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    /// Stable identifier used in results, metrics and `preferred_provider`.
    fn id(&self) -> &str;

    fn supports(&self, media: MediaType) -> bool;

    /// Whether the provider is configured well enough to be called.
    async fn is_available(&self) -> bool;

    async fn extract(&self, bytes: &[u8], file_name: &str, media: MediaType) -> Result<ExtractedFields, ProviderError>;

    fn confidence(&self, fields: &ExtractedFields) -> f64 {
        score_fields(fields)
    }
}

/// Position in the fixed provider order: local structured sources before remote vision models.
fn priority(config: &ProviderConfig) -> u8 {
    match config {
        ProviderConfig::Spreadsheet => 0,
        ProviderConfig::DocumentIntelligence { .. } => 1,
        ProviderConfig::OpenaiVision { .. } => 2,
        ProviderConfig::AnthropicVision { .. } => 3,
    }
}

/// Instantiate the configured providers in priority order.
pub fn build_providers(
    configs: &[ProviderConfig],
    rates: GstRateTable,
    request_timeout: Duration,
) -> Result<Vec<Arc<dyn ExtractionProvider>>, ProviderError> {
    let client = reqwest::Client::builder()
        .timeout(request_timeout)
        .build()
        .map_err(|e| ProviderError::unavailable("http", e))?;

    let mut ordered: Vec<&ProviderConfig> = configs.iter().collect();
    ordered.sort_by_key(|c| priority(c));

    let providers = ordered
        .into_iter()
        .map(|config| -> Arc<dyn ExtractionProvider> {
            match config {
                ProviderConfig::Spreadsheet => Arc::new(SpreadsheetProvider::new(rates.clone())),
                ProviderConfig::DocumentIntelligence {
                    endpoint,
                    api_key,
                    model,
                    poll_interval_ms,
                    max_polls,
                } => Arc::new(DocumentIntelligenceProvider::new(
                    client.clone(),
                    endpoint,
                    api_key,
                    model,
                    Duration::from_millis(*poll_interval_ms),
                    *max_polls,
                )),
                ProviderConfig::OpenaiVision { api_key, model, base_url } => Arc::new(VisionProvider::new(
                    VisionFlavour::OpenAi,
                    client.clone(),
                    base_url,
                    api_key,
                    model,
                )),
                ProviderConfig::AnthropicVision { api_key, model, base_url } => Arc::new(VisionProvider::new(
                    VisionFlavour::Anthropic,
                    client.clone(),
                    base_url,
                    api_key,
                    model,
                )),
            }
        })
        .collect();

    Ok(providers)
}

// Lenient readers for JSON replies where values may arrive as strings or numbers.

pub(crate) fn json_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => clean_text(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn json_amount(value: Option<&Value>) -> Option<Decimal> {
    match value? {
        Value::Number(n) => parse_amount(&n.to_string()),
        Value::String(s) => parse_amount(s),
        _ => None,
    }
}

pub(crate) fn json_date(value: Option<&Value>) -> Option<chrono::NaiveDate> {
    value?.as_str().and_then(parse_date)
}
