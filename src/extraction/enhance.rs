//! Post-extraction enhancement: identifier clean-up, total reconciliation and vendor backfill.

use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use super::identifiers::normalize_identifier;
use super::similarity::similarity_ratio;
use crate::jurisdiction::GstRateTable;
use crate::models::{cent, round_money, ExtractedFields, ExtractionResult, Party};
use crate::storage::VendorDirectory;

pub struct Enhancer {
    rates: GstRateTable,
    vendors: Option<Arc<dyn VendorDirectory>>,
    name_threshold: f64,
}

impl Enhancer {
    pub fn new(rates: GstRateTable, vendors: Option<Arc<dyn VendorDirectory>>, name_threshold: f64) -> Self {
        Enhancer {
            rates,
            vendors,
            name_threshold,
        }
    }

    pub async fn enhance(&self, mut result: ExtractionResult, owner: Option<Uuid>) -> ExtractionResult {
        normalize_identifiers(&mut result.fields);

        let warnings = reconcile_totals(&mut result.fields, &self.rates);
        result.warnings.extend(warnings);

        if let Some(warning) = self.backfill_vendor(&mut result.fields, owner).await {
            result.warnings.push(warning);
        }

        result
    }

    async fn backfill_vendor(&self, fields: &mut ExtractedFields, owner: Option<Uuid>) -> Option<String> {
        let directory = self.vendors.as_ref()?;
        let vendor = &fields.vendor;
        if vendor.name.is_none() && vendor.uen.is_none() {
            return None;
        }
        if vendor.name.is_some() && vendor.uen.is_some() && vendor.gst_registration_number.is_some() {
            return None;
        }

        let candidates = match directory
            .find_vendors(owner, vendor.name.as_deref(), vendor.uen.as_deref())
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!(error = %e, "vendor backfill lookup failed");
                return None;
            }
        };

        let best = best_vendor_match(vendor, &candidates, self.name_threshold)?;
        let filled = fill_party(&mut fields.vendor, &best);
        if filled.is_empty() {
            None
        } else {
            Some(format!("vendor {} backfilled from prior invoices", filled.join(", ")))
        }
    }
}

pub fn normalize_identifiers(fields: &mut ExtractedFields) {
    for id in [
        &mut fields.customer.uen,
        &mut fields.vendor.uen,
        &mut fields.vendor.gst_registration_number,
        &mut fields.customer.gst_registration_number,
    ] {
        if let Some(raw) = id.take() {
            let normalized = normalize_identifier(&raw);
            *id = if normalized.is_empty() { None } else { Some(normalized) };
        }
    }
}

/// Make subtotal + tax == total within one cent, deriving missing amounts.
pub fn reconcile_totals(fields: &mut ExtractedFields, rates: &GstRateTable) -> Vec<String> {
    let mut warnings = Vec::new();
    let (rate, _) = rates.effective(fields.invoice_date);

    for amount in [&mut fields.subtotal, &mut fields.tax_amount, &mut fields.total_amount] {
        *amount = amount.map(round_money);
    }

    if fields.subtotal.is_none() {
        if let Some(sum) = fields.line_items_sum() {
            fields.subtotal = Some(round_money(sum));
            warnings.push("subtotal derived from line items".to_string());
        }
    }

    match (fields.subtotal, fields.tax_amount, fields.total_amount) {
        (Some(subtotal), None, _) => {
            fields.tax_amount = Some(rates.tax_for(subtotal, rate));
            warnings.push(format!("tax amount computed at {}%", rate));
        }
        (None, Some(tax), Some(total)) => {
            fields.subtotal = Some(total - tax);
            warnings.push("subtotal derived from total and tax".to_string());
        }
        (None, None, Some(total)) => {
            let subtotal = round_money(total * Decimal::ONE_HUNDRED / (Decimal::ONE_HUNDRED + rate));
            fields.subtotal = Some(subtotal);
            fields.tax_amount = Some(total - subtotal);
            warnings.push(format!("subtotal and tax back-calculated from total at {}%", rate));
        }
        _ => {}
    }

    if let (Some(subtotal), Some(tax)) = (fields.subtotal, fields.tax_amount) {
        let expected = subtotal + tax;
        match fields.total_amount {
            None => fields.total_amount = Some(expected),
            Some(total) => {
                let diff = (total - expected).abs();
                if diff > Decimal::ONE {
                    warnings.push(format!("total {} inconsistent with subtotal + tax, replaced with {}", total, expected));
                    fields.total_amount = Some(expected);
                } else if diff > cent() {
                    // rounding on the document's tax line
                    fields.tax_amount = Some(total - subtotal);
                    warnings.push(format!("tax adjusted by {} to match stated total", total - expected));
                }
            }
        }
    }

    warnings
}

fn best_vendor_match(vendor: &Party, candidates: &[Party], threshold: f64) -> Option<Party> {
    if let Some(uen) = vendor.uen.as_deref() {
        if let Some(found) = candidates.iter().find(|c| c.uen.as_deref() == Some(uen)) {
            return Some(found.clone());
        }
    }

    let name = vendor.name.as_deref()?;
    candidates
        .iter()
        .filter_map(|c| {
            let ratio = similarity_ratio(name, c.name.as_deref()?);
            (ratio >= threshold).then_some((ratio, c))
        })
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(_, c)| c.clone())
}

fn fill_party(target: &mut Party, source: &Party) -> Vec<&'static str> {
    let mut filled = Vec::new();
    if target.name.is_none() && source.name.is_some() {
        target.name = source.name.clone();
        filled.push("name");
    }
    if target.uen.is_none() && source.uen.is_some() {
        target.uen = source.uen.clone();
        filled.push("uen");
    }
    if target.gst_registration_number.is_none() && source.gst_registration_number.is_some() {
        target.gst_registration_number = source.gst_registration_number.clone();
        filled.push("gst registration number");
    }
    if target.address.is_none() && source.address.is_some() {
        target.address = source.address.clone();
        filled.push("address");
    }
    filled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StorageResult;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::str::FromStr;
    use std::time::Duration;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn dated(subtotal: Option<&str>, tax: Option<&str>, total: Option<&str>) -> ExtractedFields {
        ExtractedFields {
            invoice_date: NaiveDate::from_ymd_opt(2024, 6, 1),
            subtotal: subtotal.map(dec),
            tax_amount: tax.map(dec),
            total_amount: total.map(dec),
            ..Default::default()
        }
    }

    fn assert_reconciled(fields: &ExtractedFields) {
        let (s, t, total) = (fields.subtotal.unwrap(), fields.tax_amount.unwrap(), fields.total_amount.unwrap());
        assert!((s + t - total).abs() <= cent(), "{} + {} != {}", s, t, total);
    }

    #[test]
    fn test_tax_computed_at_rate_for_date() {
        let rates = GstRateTable::default();
        let mut fields = dated(Some("1000"), None, None);
        reconcile_totals(&mut fields, &rates);
        assert_eq!(fields.tax_amount, Some(dec("90.00")));
        assert_eq!(fields.total_amount, Some(dec("1090.00")));

        let mut older = dated(Some("1000"), None, None);
        older.invoice_date = NaiveDate::from_ymd_opt(2023, 6, 1);
        reconcile_totals(&mut older, &rates);
        assert_eq!(older.tax_amount, Some(dec("80.00")));
    }

    #[test]
    fn test_inconsistent_total_is_recomputed() {
        let rates = GstRateTable::default();
        let mut fields = dated(Some("1000"), Some("90"), Some("1100"));
        let warnings = reconcile_totals(&mut fields, &rates);
        assert_eq!(fields.total_amount, Some(dec("1090.00")));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_small_discrepancy_is_absorbed_by_tax() {
        let rates = GstRateTable::default();
        let mut fields = dated(Some("1000"), Some("90"), Some("1090.40"));
        reconcile_totals(&mut fields, &rates);
        assert_eq!(fields.total_amount, Some(dec("1090.40")));
        assert_reconciled(&fields);
    }

    #[test]
    fn test_reconciliation_invariant_over_shapes() {
        let rates = GstRateTable::default();
        let shapes = [
            dated(Some("1000"), None, None),
            dated(None, None, Some("1090")),
            dated(None, Some("90"), Some("1090")),
            dated(Some("333.33"), Some("29.99"), Some("999.99")),
            dated(Some("12.345"), Some("1.111"), Some("13.46")),
        ];
        for mut fields in shapes {
            reconcile_totals(&mut fields, &rates);
            assert_reconciled(&fields);
        }
    }

    struct StaticVendors(Vec<Party>);

    #[async_trait]
    impl VendorDirectory for StaticVendors {
        async fn find_vendors(&self, _: Option<Uuid>, _: Option<&str>, _: Option<&str>) -> StorageResult<Vec<Party>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_enhance_backfills_vendor_and_normalizes_ids() {
        let known = Party {
            name: Some("Acme Pte Ltd".into()),
            uen: Some("201912345A".into()),
            gst_registration_number: Some("M212345678".into()),
            address: Some("1 Raffles Place, Singapore 048616".into()),
        };
        let enhancer = Enhancer::new(GstRateTable::default(), Some(Arc::new(StaticVendors(vec![known]))), 0.8);

        let mut fields = dated(Some("100"), Some("9"), Some("109"));
        fields.vendor.name = Some("ACME Pte. Ltd".into());
        fields.customer.uen = Some("2O2O-54321 b".into());
        let result = ExtractionResult::new(fields, 0.7, "test", Duration::ZERO);

        let enhanced = enhancer.enhance(result, None).await;

        assert_eq!(enhanced.fields.vendor.uen.as_deref(), Some("201912345A"));
        assert_eq!(enhanced.fields.vendor.gst_registration_number.as_deref(), Some("M212345678"));
        assert_eq!(enhanced.fields.customer.uen.as_deref(), Some("202054321B"));
        assert!(enhanced.warnings.iter().any(|w| w.contains("backfilled")));
    }

    #[test]
    fn test_foreign_vendor_tax_id_survives_normalization() {
        let mut fields = dated(Some("100"), None, None);
        fields.vendor.gst_registration_number = Some("gb 123 4567 89".into());
        fields.vendor.uen = Some("HRB-86891".into());

        normalize_identifiers(&mut fields);

        assert_eq!(fields.vendor.gst_registration_number.as_deref(), Some("GB123456789"));
        assert_eq!(fields.vendor.uen.as_deref(), Some("HRB86891"));
    }
}
