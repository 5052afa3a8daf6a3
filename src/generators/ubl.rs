use minijinja::{AutoEscape, Environment};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

use super::DocumentGenerator;
use crate::core::GenerationError;
use crate::jurisdiction::{GstRateTable, COUNTRY_CODE, CURRENCY};
use crate::models::{Invoice, LineItem, Party, TaxCategory};
use crate::validation::totals;

const TEMPLATE_NAME: &str = "ubl_invoice.xml";
const TEMPLATE: &str = include_str!("ubl_invoice.xml");

/// Singapore PINT profile of Peppol BIS Billing 3.0.
const CUSTOMIZATION_ID: &str = "urn:peppol:pint:billing-1@sg-1";
const PROFILE_ID: &str = "urn:peppol:bis:billing";
const ENDPOINT_SCHEME: &str = "0195";

#[derive(Serialize)]
struct PartyView {
    name: String,
    uen: Option<String>,
    tax_id: Option<String>,
    address: Option<String>,
    endpoint: Option<String>,
    country: &'static str,
}

#[derive(Serialize)]
struct LineView {
    description: String,
    quantity: String,
    unit_price: String,
    amount: String,
    category: &'static str,
    percent: String,
}

#[derive(Serialize)]
struct TaxSubtotalView {
    category: &'static str,
    percent: String,
    taxable: String,
    tax: String,
}

#[derive(Serialize)]
struct InvoiceView {
    customization_id: &'static str,
    profile_id: &'static str,
    scheme: &'static str,
    number: String,
    issue_date: String,
    due_date: Option<String>,
    currency: String,
    seller: PartyView,
    buyer: PartyView,
    lines: Vec<LineView>,
    tax_subtotals: Vec<TaxSubtotalView>,
    subtotal: String,
    tax_amount: String,
    total: String,
}

/// UBL 2.1 invoice XML for InvoiceNow.
pub struct UblGenerator {
    env: Environment<'static>,
    rates: GstRateTable,
}

impl UblGenerator {
    pub fn new(rates: GstRateTable) -> Result<Self, GenerationError> {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.add_filter("xml", xml_escape);
        env.add_template(TEMPLATE_NAME, TEMPLATE)?;
        Ok(UblGenerator { env, rates })
    }

    fn view(&self, invoice: &Invoice) -> Result<InvoiceView, GenerationError> {
        let number = required(invoice.invoice_number.as_deref(), "invoice number")?;
        let issue_date = invoice
            .invoice_date
            .ok_or_else(|| GenerationError::Incomplete("invoice date is missing".into()))?;
        let seller_name = required(invoice.vendor.name.as_deref(), "seller name")?;
        let buyer_name = required(invoice.customer.name.as_deref(), "buyer name")?;
        if invoice.line_items.is_empty() {
            return Err(GenerationError::Incomplete("invoice has no lines".into()));
        }

        let (effective, _) = self.rates.effective(Some(issue_date));
        let rate = totals::invoice_rate(invoice, effective);
        let computed = totals::from_line_items(&invoice.line_items, rate, &self.rates);

        let mut groups: BTreeMap<(&'static str, Decimal), Decimal> = BTreeMap::new();
        let lines = invoice
            .line_items
            .iter()
            .map(|item| {
                let (category, percent) = classify(item, rate);
                *groups.entry((category, percent)).or_default() += item.amount;
                LineView {
                    description: item.description.clone(),
                    quantity: item.quantity.normalize().to_string(),
                    unit_price: money(item.unit_price),
                    amount: money(item.amount),
                    category,
                    percent: percent.normalize().to_string(),
                }
            })
            .collect();
        let tax_subtotals = groups
            .into_iter()
            .map(|((category, percent), taxable)| TaxSubtotalView {
                category,
                percent: percent.normalize().to_string(),
                taxable: money(taxable),
                tax: money(self.rates.tax_for(taxable, percent)),
            })
            .collect();

        let subtotal = invoice.subtotal.unwrap_or(computed.subtotal);
        let tax = invoice.tax_amount.unwrap_or(computed.tax);
        let total = invoice.total_amount.unwrap_or(subtotal + tax);

        Ok(InvoiceView {
            customization_id: CUSTOMIZATION_ID,
            profile_id: PROFILE_ID,
            scheme: ENDPOINT_SCHEME,
            number: number.to_string(),
            issue_date: issue_date.to_string(),
            due_date: invoice.due_date.map(|d| d.to_string()),
            currency: invoice.currency.clone().unwrap_or_else(|| CURRENCY.to_string()),
            seller: party_view(&invoice.vendor, seller_name, invoice.peppol_participant_id.as_deref()),
            buyer: party_view(&invoice.customer, buyer_name, None),
            lines,
            tax_subtotals,
            subtotal: money(subtotal),
            tax_amount: money(tax),
            total: money(total),
        })
    }
}

impl DocumentGenerator for UblGenerator {
    fn content_type(&self) -> &'static str {
        "application/xml"
    }

    fn generate(&self, invoice: &Invoice) -> Result<Vec<u8>, GenerationError> {
        let view = self.view(invoice)?;
        let template = self.env.get_template(TEMPLATE_NAME)?;
        Ok(template.render(&view)?.into_bytes())
    }
}

fn required<'a>(value: Option<&'a str>, what: &str) -> Result<&'a str, GenerationError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| GenerationError::Incomplete(format!("{} is missing", what)))
}

/// Line category and percent; lines without a category are standard-rated
/// unless they explicitly carry 0%.
fn classify(item: &LineItem, rate: Decimal) -> (&'static str, Decimal) {
    let percent = totals::line_rate(item, rate);
    let category = match item.tax_category {
        Some(category) => category,
        None if percent.is_zero() => TaxCategory::ZeroRated,
        None => TaxCategory::Standard,
    };
    (category.code(), percent)
}

/// Participant ids carry the scheme prefix; the endpoint element holds only the identifier.
fn party_view(party: &Party, name: &str, participant_id: Option<&str>) -> PartyView {
    let endpoint = participant_id.map(|id| {
        id.split_once(':')
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_else(|| id.to_string())
    });
    PartyView {
        name: name.to_string(),
        uen: party.uen.clone(),
        tax_id: party.gst_registration_number.clone(),
        address: party.address.clone(),
        endpoint,
        country: COUNTRY_CODE,
    }
}

fn money(value: Decimal) -> String {
    format!("{:.2}", value)
}

fn xml_escape(value: String) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
