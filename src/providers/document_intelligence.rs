//! Azure Document Intelligence `prebuilt-invoice` adapter.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::{json_amount, json_date, json_text, ExtractionProvider};
use crate::core::ProviderError;
use crate::extraction::parse::parse_rate;
use crate::models::{ExtractedFields, LineItem, MediaType, TaxCategory};

const ID: &str = "document_intelligence";
const API_VERSION: &str = "2024-11-30";

pub struct DocumentIntelligenceProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl DocumentIntelligenceProvider {
    pub fn new(
        client: reqwest::Client,
        endpoint: &str,
        api_key: &str,
        model: &str,
        poll_interval: Duration,
        max_polls: u32,
    ) -> Self {
        DocumentIntelligenceProvider {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            poll_interval,
            max_polls,
        }
    }

    fn analyze_url(&self) -> String {
        format!(
            "{}/documentintelligence/documentModels/{}:analyze?api-version={}",
            self.endpoint, self.model, API_VERSION
        )
    }

    async fn poll(&self, operation_url: &str) -> Result<Value, ProviderError> {
        for _ in 0..self.max_polls {
            tokio::time::sleep(self.poll_interval).await;

            let body: Value = self
                .client
                .get(operation_url)
                .header("Ocp-Apim-Subscription-Key", &self.api_key)
                .send()
                .await
                .map_err(|e| ProviderError::http(ID, e))?
                .json()
                .await
                .map_err(|e| ProviderError::parse(ID, e))?;

            match body.get("status").and_then(Value::as_str).unwrap_or("") {
                "succeeded" => {
                    return body
                        .get("analyzeResult")
                        .cloned()
                        .ok_or_else(|| ProviderError::parse(ID, "succeeded without analyzeResult"));
                }
                "failed" => {
                    let message = body
                        .pointer("/error/message")
                        .and_then(Value::as_str)
                        .unwrap_or("analysis failed");
                    return Err(ProviderError::http(ID, message));
                }
                _ => continue,
            }
        }
        Err(ProviderError::unavailable(ID, format!("analysis not finished after {} polls", self.max_polls)))
    }
}

#[async_trait]
impl ExtractionProvider for DocumentIntelligenceProvider {
    fn id(&self) -> &str {
        ID
    }

    fn supports(&self, media: MediaType) -> bool {
        matches!(media, MediaType::Pdf | MediaType::Jpeg | MediaType::Png)
    }

    async fn is_available(&self) -> bool {
        !self.endpoint.is_empty() && !self.api_key.is_empty()
    }

    async fn extract(&self, bytes: &[u8], _file_name: &str, media: MediaType) -> Result<ExtractedFields, ProviderError> {
        let response = self
            .client
            .post(self.analyze_url())
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .header("Content-Type", media.mime())
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    ProviderError::unavailable(ID, e)
                } else {
                    ProviderError::http(ID, e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::http(ID, format!("{}: {}", status, body)));
        }

        let operation_url = response
            .headers()
            .get("Operation-Location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::parse(ID, "no Operation-Location in response"))?;

        let result = self.poll(&operation_url).await?;
        Ok(map_analyze_result(&result))
    }
}

/// Typed value of an analyzed field, falling back to its raw content.
fn field_value(field: &Value) -> Option<&Value> {
    ["valueString", "valueDate", "valueNumber", "content"]
        .iter()
        .find_map(|key| field.get(*key))
}

fn text_of(fields: &Value, name: &str) -> Option<String> {
    let field = fields.get(name)?;
    if let Some(street) = field.pointer("/valueAddress/streetAddress") {
        if field.get("content").is_none() {
            return json_text(Some(street));
        }
    }
    json_text(field_value(field))
}

fn amount_of(fields: &Value, name: &str) -> Option<rust_decimal::Decimal> {
    let field = fields.get(name)?;
    json_amount(field.pointer("/valueCurrency/amount").or_else(|| field_value(field)))
}

fn item_from(item: &Value) -> Option<LineItem> {
    let obj = item.get("valueObject")?;
    let description = text_of(obj, "Description").or_else(|| text_of(obj, "ProductCode"))?;
    let quantity = amount_of(obj, "Quantity").unwrap_or(rust_decimal::Decimal::ONE);
    let amount = amount_of(obj, "Amount");
    let unit_price = amount_of(obj, "UnitPrice");

    let (unit_price, amount) = match (unit_price, amount) {
        (Some(p), Some(a)) => (p, a),
        (Some(p), None) => (p, crate::models::round_money(p * quantity)),
        (None, Some(a)) if !quantity.is_zero() => (crate::models::round_money(a / quantity), a),
        _ => return None,
    };

    Some(LineItem {
        description,
        quantity,
        unit_price,
        amount,
        tax_rate: text_of(obj, "TaxRate").and_then(|r| parse_rate(&r)),
        tax_category: None,
    })
}

/// Map an `analyzeResult` body onto extracted fields.
pub fn map_analyze_result(result: &Value) -> ExtractedFields {
    let Some(fields) = result.pointer("/documents/0/fields") else {
        return ExtractedFields::default();
    };

    let mut out = ExtractedFields {
        invoice_number: text_of(fields, "InvoiceId"),
        invoice_date: fields.get("InvoiceDate").and_then(|f| json_date(field_value(f))),
        due_date: fields.get("DueDate").and_then(|f| json_date(field_value(f))),
        subtotal: amount_of(fields, "SubTotal"),
        tax_amount: amount_of(fields, "TotalTax"),
        total_amount: amount_of(fields, "InvoiceTotal"),
        currency: fields
            .pointer("/InvoiceTotal/valueCurrency/currencyCode")
            .and_then(Value::as_str)
            .map(str::to_string),
        ..Default::default()
    };

    out.customer.name = text_of(fields, "CustomerName");
    out.customer.address = text_of(fields, "CustomerAddress");
    out.customer.uen = text_of(fields, "CustomerTaxId");
    out.vendor.name = text_of(fields, "VendorName");
    out.vendor.address = text_of(fields, "VendorAddress");
    out.vendor.gst_registration_number = text_of(fields, "VendorTaxId");

    if let Some(items) = fields.pointer("/Items/valueArray").and_then(Value::as_array) {
        out.line_items = items.iter().filter_map(item_from).collect();
    }

    // zero-tax lines carry no category on the analyzed document
    for item in &mut out.line_items {
        if item.tax_rate.map(|r| r.is_zero()).unwrap_or(false) {
            item.tax_category = Some(TaxCategory::ZeroRated);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use serde_json::json;

    #[test]
    fn test_maps_prebuilt_invoice_fields() {
        let result = json!({
            "documents": [{
                "fields": {
                    "InvoiceId": {"type": "string", "valueString": "INV-88", "content": "INV-88"},
                    "InvoiceDate": {"type": "date", "valueDate": "2024-02-01", "content": "1 Feb 2024"},
                    "CustomerName": {"type": "string", "valueString": "Globex Pte Ltd"},
                    "VendorName": {"type": "string", "valueString": "Acme Pte Ltd"},
                    "VendorTaxId": {"type": "string", "valueString": "M2-1234567-8"},
                    "SubTotal": {"type": "currency", "valueCurrency": {"amount": 200.0, "currencyCode": "SGD"}},
                    "TotalTax": {"type": "currency", "valueCurrency": {"amount": 18.0, "currencyCode": "SGD"}},
                    "InvoiceTotal": {"type": "currency", "valueCurrency": {"amount": 218.0, "currencyCode": "SGD"}},
                    "Items": {"type": "array", "valueArray": [
                        {"type": "object", "valueObject": {
                            "Description": {"type": "string", "valueString": "Support plan"},
                            "Quantity": {"type": "number", "valueNumber": 2},
                            "UnitPrice": {"type": "currency", "valueCurrency": {"amount": 100.0}},
                            "Amount": {"type": "currency", "valueCurrency": {"amount": 200.0}}
                        }}
                    ]}
                }
            }]
        });

        let fields = map_analyze_result(&result);

        assert_eq!(fields.invoice_number.as_deref(), Some("INV-88"));
        assert_eq!(fields.invoice_date, NaiveDate::from_ymd_opt(2024, 2, 1));
        assert_eq!(fields.customer.name.as_deref(), Some("Globex Pte Ltd"));
        assert_eq!(fields.vendor.gst_registration_number.as_deref(), Some("M2-1234567-8"));
        assert_eq!(fields.total_amount, Some(Decimal::from(218)));
        assert_eq!(fields.currency.as_deref(), Some("SGD"));
        assert_eq!(fields.line_items.len(), 1);
        assert_eq!(fields.line_items[0].quantity, Decimal::from(2));
        assert_eq!(fields.line_items[0].amount, Decimal::from(200));
    }

    #[test]
    fn test_empty_result_maps_to_empty_fields() {
        assert_eq!(map_analyze_result(&json!({"documents": []})), ExtractedFields::default());
    }

    #[tokio::test]
    async fn test_unconfigured_provider_is_unavailable() {
        let provider =
            DocumentIntelligenceProvider::new(reqwest::Client::new(), "", "", "prebuilt-invoice", Duration::ZERO, 1);
        assert!(!provider.is_available().await);
        assert!(provider.supports(MediaType::Png));
        assert!(!provider.supports(MediaType::Xlsx));
    }
}
