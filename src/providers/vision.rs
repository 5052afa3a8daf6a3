//! General-purpose vision model adapters (OpenAI chat completions, Anthropic messages).

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};

use super::{json_amount, json_date, json_text, ExtractionProvider};
use crate::core::ProviderError;
use crate::extraction::parse::parse_rate;
use crate::models::{round_money, ExtractedFields, LineItem, MediaType, TaxCategory};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

const PROMPT: &str = "Extract the invoice on this document. Reply with a single JSON object and nothing else, \
using these keys (null when absent): invoice_number, invoice_date (YYYY-MM-DD), due_date (YYYY-MM-DD), \
customer_name, customer_uen, customer_address, vendor_name, vendor_uen, vendor_gst_number, vendor_address, \
subtotal, tax_amount, total_amount, currency (ISO 4217), line_items (array of objects with description, \
quantity, unit_price, amount, tax_rate as a percent, tax_category as S, Z, E or O). \
Amounts are plain numbers without currency symbols.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisionFlavour {
    OpenAi,
    Anthropic,
}

pub struct VisionProvider {
    flavour: VisionFlavour,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl VisionProvider {
    pub fn new(flavour: VisionFlavour, client: reqwest::Client, base_url: &str, api_key: &str, model: &str) -> Self {
        VisionProvider {
            flavour,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    fn request_body(&self, bytes: &[u8], media: MediaType) -> Value {
        let data = STANDARD.encode(bytes);
        match self.flavour {
            VisionFlavour::OpenAi => json!({
                "model": self.model,
                "temperature": 0,
                "response_format": {"type": "json_object"},
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "text", "text": PROMPT},
                        {"type": "image_url", "image_url": {"url": format!("data:{};base64,{}", media.mime(), data)}}
                    ]
                }]
            }),
            VisionFlavour::Anthropic => {
                let block_type = if media == MediaType::Pdf { "document" } else { "image" };
                json!({
                    "model": self.model,
                    "max_tokens": MAX_TOKENS,
                    "messages": [{
                        "role": "user",
                        "content": [
                            {"type": block_type, "source": {"type": "base64", "media_type": media.mime(), "data": data}},
                            {"type": "text", "text": PROMPT}
                        ]
                    }]
                })
            }
        }
    }

    fn reply_text(&self, body: &Value) -> Option<String> {
        let text = match self.flavour {
            VisionFlavour::OpenAi => body.pointer("/choices/0/message/content"),
            VisionFlavour::Anthropic => body
                .get("content")
                .and_then(Value::as_array)
                .and_then(|blocks| blocks.iter().find(|b| b.get("type").and_then(Value::as_str) == Some("text")))
                .and_then(|b| b.get("text")),
        };
        text.and_then(Value::as_str).map(str::to_string)
    }
}

#[async_trait]
impl ExtractionProvider for VisionProvider {
    fn id(&self) -> &str {
        match self.flavour {
            VisionFlavour::OpenAi => "openai_vision",
            VisionFlavour::Anthropic => "anthropic_vision",
        }
    }

    fn supports(&self, media: MediaType) -> bool {
        match self.flavour {
            VisionFlavour::OpenAi => media.is_image(),
            VisionFlavour::Anthropic => media.is_image() || media == MediaType::Pdf,
        }
    }

    async fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn extract(&self, bytes: &[u8], _file_name: &str, media: MediaType) -> Result<ExtractedFields, ProviderError> {
        let id = self.id();
        let request = match self.flavour {
            VisionFlavour::OpenAi => self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(&self.api_key),
            VisionFlavour::Anthropic => self
                .client
                .post(format!("{}/messages", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
        };

        let response = request
            .json(&self.request_body(bytes, media))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    ProviderError::unavailable(id, e)
                } else {
                    ProviderError::http(id, e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::http(id, format!("{}: {}", status, body)));
        }

        let body: Value = response.json().await.map_err(|e| ProviderError::parse(id, e))?;
        let text = self
            .reply_text(&body)
            .ok_or_else(|| ProviderError::parse(id, "reply has no text content"))?;

        parse_reply(&text).map_err(|e| ProviderError::parse(id, e))
    }
}

/// Parse a model reply, tolerating code fences and prose around the JSON object.
pub fn parse_reply(text: &str) -> Result<ExtractedFields, String> {
    let start = text.find('{').ok_or("no JSON object in reply")?;
    let end = text.rfind('}').ok_or("no JSON object in reply")?;
    if end < start {
        return Err("no JSON object in reply".to_string());
    }
    let value: Value = serde_json::from_str(&text[start..=end]).map_err(|e| e.to_string())?;

    let mut fields = ExtractedFields {
        invoice_number: json_text(value.get("invoice_number")),
        invoice_date: json_date(value.get("invoice_date")),
        due_date: json_date(value.get("due_date")),
        subtotal: json_amount(value.get("subtotal")),
        tax_amount: json_amount(value.get("tax_amount")),
        total_amount: json_amount(value.get("total_amount")),
        currency: json_text(value.get("currency")).map(|c| c.to_ascii_uppercase()),
        ..Default::default()
    };
    fields.customer.name = json_text(value.get("customer_name"));
    fields.customer.uen = json_text(value.get("customer_uen"));
    fields.customer.address = json_text(value.get("customer_address"));
    fields.vendor.name = json_text(value.get("vendor_name"));
    fields.vendor.uen = json_text(value.get("vendor_uen"));
    fields.vendor.gst_registration_number = json_text(value.get("vendor_gst_number"));
    fields.vendor.address = json_text(value.get("vendor_address"));

    if let Some(items) = value.get("line_items").and_then(Value::as_array) {
        fields.line_items = items.iter().filter_map(line_item).collect();
    }

    Ok(fields)
}

fn line_item(item: &Value) -> Option<LineItem> {
    let description = json_text(item.get("description"))?;
    let quantity = json_amount(item.get("quantity")).unwrap_or(rust_decimal::Decimal::ONE);
    let unit_price = json_amount(item.get("unit_price"));
    let amount = json_amount(item.get("amount"));
    let (unit_price, amount) = match (unit_price, amount) {
        (Some(p), Some(a)) => (p, a),
        (Some(p), None) => (p, round_money(p * quantity)),
        (None, Some(a)) if !quantity.is_zero() => (round_money(a / quantity), a),
        _ => return None,
    };

    Some(LineItem {
        description,
        quantity,
        unit_price,
        amount,
        tax_rate: json_text(item.get("tax_rate")).and_then(|r| parse_rate(&r)),
        tax_category: json_text(item.get("tax_category")).and_then(|c| TaxCategory::parse(&c)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_parse_fenced_reply() {
        let reply = "Here you go:\n```json\n{\"invoice_number\": \"INV-5\", \"customer_name\": \"Globex\", \
                     \"total_amount\": \"S$1,090.00\", \"currency\": \"sgd\", \"line_items\": \
                     [{\"description\": \"Consulting\", \"quantity\": 10, \"unit_price\": 100, \"tax_category\": \"S\"}]}\n```";

        let fields = parse_reply(reply).unwrap();

        assert_eq!(fields.invoice_number.as_deref(), Some("INV-5"));
        assert_eq!(fields.total_amount, Some(Decimal::from(1090)));
        assert_eq!(fields.currency.as_deref(), Some("SGD"));
        assert_eq!(fields.line_items[0].amount, Decimal::from(1000));
        assert_eq!(fields.line_items[0].tax_category, Some(TaxCategory::Standard));
    }

    #[test]
    fn test_parse_reply_without_json_fails() {
        assert!(parse_reply("I cannot read this document").is_err());
    }

    #[test]
    fn test_flavours_differ_in_supported_media() {
        let client = reqwest::Client::new();
        let openai = VisionProvider::new(VisionFlavour::OpenAi, client.clone(), "https://o.test", "k", "m");
        let anthropic = VisionProvider::new(VisionFlavour::Anthropic, client, "https://a.test", "k", "m");
        assert!(!openai.supports(MediaType::Pdf));
        assert!(anthropic.supports(MediaType::Pdf));
        assert_eq!(anthropic.id(), "anthropic_vision");

        let body = anthropic.request_body(b"%PDF", MediaType::Pdf);
        assert_eq!(body.pointer("/messages/0/content/0/type"), Some(&json!("document")));
    }
}
