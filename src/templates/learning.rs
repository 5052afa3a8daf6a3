//! Derive a template from a corrected invoice and the text of its source document.

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::models::{ExtractedFields, FieldPattern, Template, TemplateField};

pub const LEARNED_PRIOR: f64 = 0.9;

const AMOUNT_CLASS: &str = r"([-(]?(?:S\$|\$|SGD)?\s?[0-9][0-9,]*(?:\.[0-9]{1,2})?\)?)";
const DATE_CLASS: &str =
    r"(\d{1,4}[./-]\d{1,2}[./-]\d{1,4}|\d{1,2}\s+[A-Za-z]{3,9},?\s+\d{4}|[A-Za-z]{3,9}\s+\d{1,2},?\s+\d{4})";
const CODE_CLASS: &str = r"([A-Za-z0-9][A-Za-z0-9/_.-]*)";
const TEXT_CLASS: &str = r"([^\n]+?)[ \t]*$";

const MAX_LABEL_WORDS: usize = 4;

const LEARNABLE: &[TemplateField] = &[
    TemplateField::InvoiceNumber,
    TemplateField::InvoiceDate,
    TemplateField::DueDate,
    TemplateField::CustomerName,
    TemplateField::CustomerUen,
    TemplateField::CustomerAddress,
    TemplateField::VendorName,
    TemplateField::VendorUen,
    TemplateField::VendorGstNumber,
    TemplateField::VendorAddress,
    TemplateField::Subtotal,
    TemplateField::TaxAmount,
    TemplateField::TotalAmount,
    TemplateField::Currency,
];

fn amount_forms(value: Decimal) -> Vec<String> {
    let fixed = format!("{:.2}", value);
    let (int_part, frac) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let digits: Vec<char> = int_part.trim_start_matches('-').chars().collect();
    let mut grouped = String::new();
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(*c);
    }
    let mut forms = vec![format!("{}.{}", grouped, frac), fixed.trim_start_matches('-').to_string()];
    if frac == "00" {
        forms.push(digits.iter().collect());
    }
    forms.dedup();
    forms
}

fn date_forms(date: NaiveDate) -> Vec<String> {
    ["%d/%m/%Y", "%Y-%m-%d", "%d %b %Y", "%d %B %Y", "%d-%m-%Y", "%d.%m.%Y", "%b %d, %Y", "%B %d, %Y"]
        .iter()
        .map(|fmt| date.format(fmt).to_string())
        .collect()
}

/// Forms the field's value may take on the document, plus the capture class to learn.
fn value_forms(fields: &ExtractedFields, field: TemplateField) -> Option<(Vec<String>, &'static str)> {
    let text = |v: &Option<String>| v.clone().map(|s| (vec![s], TEXT_CLASS));
    let code = |v: &Option<String>| v.clone().map(|s| (vec![s], CODE_CLASS));
    match field {
        TemplateField::InvoiceNumber => code(&fields.invoice_number),
        TemplateField::InvoiceDate => fields.invoice_date.map(|d| (date_forms(d), DATE_CLASS)),
        TemplateField::DueDate => fields.due_date.map(|d| (date_forms(d), DATE_CLASS)),
        TemplateField::CustomerName => text(&fields.customer.name),
        TemplateField::CustomerUen => code(&fields.customer.uen),
        TemplateField::CustomerAddress => text(&fields.customer.address),
        TemplateField::VendorName => text(&fields.vendor.name),
        TemplateField::VendorUen => code(&fields.vendor.uen),
        TemplateField::VendorGstNumber => code(&fields.vendor.gst_registration_number),
        TemplateField::VendorAddress => text(&fields.vendor.address),
        TemplateField::Subtotal => fields.subtotal.map(|v| (amount_forms(v), AMOUNT_CLASS)),
        TemplateField::TaxAmount => fields.tax_amount.map(|v| (amount_forms(v), AMOUNT_CLASS)),
        TemplateField::TotalAmount => fields.total_amount.map(|v| (amount_forms(v), AMOUNT_CLASS)),
        TemplateField::Currency => code(&fields.currency),
    }
}

fn is_value_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == ',' || c == '.'
}

/// Text preceding the first standalone occurrence of any form on a line.
fn find_label(text: &str, forms: &[String]) -> Option<String> {
    for line in text.lines() {
        for form in forms.iter().filter(|f| !f.is_empty()) {
            let mut from = 0;
            while let Some(pos) = line[from..].find(form.as_str()) {
                let start = from + pos;
                let end = start + form.len();
                let before_ok = line[..start].chars().next_back().map(|c| !is_value_char(c)).unwrap_or(true);
                let after_ok = line[end..].chars().next().map(|c| !is_value_char(c) || c == '.').unwrap_or(true);
                if before_ok && after_ok {
                    let words: Vec<&str> = line[..start].split_whitespace().collect();
                    let label = words[words.len().saturating_sub(MAX_LABEL_WORDS)..].join(" ");
                    if label.chars().any(char::is_alphabetic) {
                        return Some(label);
                    }
                }
                from = end;
            }
        }
    }
    None
}

fn label_regex(label: &str) -> String {
    let words: Vec<String> = label.split_whitespace().map(regex::escape).collect();
    let boundary = if label.starts_with(|c: char| c.is_alphanumeric()) { r"\b" } else { "" };
    format!("{}{}", boundary, words.join(r"\s+"))
}

/// Build a template from the populated fields whose values can be located in `text`.
/// Returns `None` when no field could be anchored to a label.
pub fn learn_template(name: &str, fields: &ExtractedFields, text: &str) -> Option<Template> {
    let patterns: Vec<FieldPattern> = LEARNABLE
        .iter()
        .filter_map(|field| {
            let (forms, class) = value_forms(fields, *field)?;
            let label = find_label(text, &forms)?;
            Some(FieldPattern {
                field: *field,
                pattern: format!(r"(?m){}[ \t]*{}", label_regex(&label), class),
            })
        })
        .collect();

    if patterns.is_empty() {
        return None;
    }

    let bound_party = fields.vendor.uen.clone().or_else(|| fields.vendor.name.clone());
    tracing::debug!(name, patterns = patterns.len(), "learned template");
    Some(Template::new(name, bound_party, patterns, LEARNED_PRIOR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::TemplateMatcher;
    use pretty_assertions::assert_eq;

    const FIRST: &str = "ACME PTE LTD\nUEN: 201912345A\nInvoice No: INV-1001\nDate: 15/03/2024\n\
                         Bill To: Globex Pte Ltd\nSubtotal 1,000.00\nGST 9% 90.00\nTotal 1,090.00\n";
    const SECOND: &str = "ACME PTE LTD\nUEN: 201912345A\nInvoice No: INV-1002\nDate: 02/04/2024\n\
                          Bill To: Initech Holdings\nSubtotal 2,500.00\nGST 9% 225.00\nTotal 2,725.00\n";

    fn corrected() -> ExtractedFields {
        let mut fields = ExtractedFields {
            invoice_number: Some("INV-1001".into()),
            invoice_date: NaiveDate::from_ymd_opt(2024, 3, 15),
            subtotal: Some(Decimal::new(1000, 0)),
            tax_amount: Some(Decimal::new(90, 0)),
            total_amount: Some(Decimal::new(1090, 0)),
            ..Default::default()
        };
        fields.customer.name = Some("Globex Pte Ltd".into());
        fields.vendor.uen = Some("201912345A".into());
        fields
    }

    #[test]
    fn test_amount_forms() {
        assert_eq!(amount_forms(Decimal::new(1090, 0)), vec!["1,090.00", "1090.00", "1090"]);
        assert_eq!(amount_forms(Decimal::new(905, 1)), vec!["90.50"]);
    }

    #[test]
    fn test_label_ignores_embedded_occurrences() {
        let text = "Total 1,090.00\nGST 90.00";
        assert_eq!(find_label(text, &["90.00".to_string()]), Some("GST".to_string()));
    }

    #[test]
    fn test_learned_template_binds_vendor() {
        let template = learn_template("acme", &corrected(), FIRST).unwrap();
        assert_eq!(template.bound_party.as_deref(), Some("201912345A"));
        assert_eq!(template.confidence_prior, LEARNED_PRIOR);
        // vendor name has no label on the document
        assert_eq!(template.patterns.len(), 7);
    }

    #[tokio::test]
    async fn test_learned_template_reads_the_next_document() {
        let template = learn_template("acme", &corrected(), FIRST).unwrap();
        let matcher = TemplateMatcher::new(None, 50);
        matcher.add(template).await.unwrap();

        let found = matcher.match_text(SECOND).await.unwrap();

        assert!(found.confidence >= 0.85);
        assert_eq!(found.fields.invoice_number.as_deref(), Some("INV-1002"));
        assert_eq!(found.fields.invoice_date, NaiveDate::from_ymd_opt(2024, 4, 2));
        assert_eq!(found.fields.customer.name.as_deref(), Some("Initech Holdings"));
        assert_eq!(found.fields.subtotal, Some(Decimal::new(2500, 0)));
        assert_eq!(found.fields.tax_amount, Some(Decimal::new(225, 0)));
        assert_eq!(found.fields.total_amount, Some(Decimal::new(2725, 0)));
    }

    #[test]
    fn test_nothing_to_learn_from_unrelated_text() {
        assert!(learn_template("x", &corrected(), "lorem ipsum").is_none());
    }
}
