use chrono::Utc;
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::StorageResult;
use crate::extraction::parse::{clean_text, parse_amount, parse_date};
use crate::models::{ExtractedFields, ExtractionResult, Template, TemplateField};
use crate::storage::TemplateRepository;

/// A template with its patterns compiled.
struct CompiledTemplate {
    template: Template,
    patterns: Vec<(TemplateField, Regex)>,
}

impl CompiledTemplate {
    fn compile(template: Template) -> Self {
        let patterns = template
            .patterns
            .iter()
            .filter_map(|p| match Regex::new(&p.pattern) {
                Ok(re) => Some((p.field, re)),
                Err(e) => {
                    tracing::warn!(template = %template.id, field = %p.field, error = %e, "skipping invalid template pattern");
                    None
                }
            })
            .collect();
        CompiledTemplate { template, patterns }
    }

    fn applies_to(&self, text: &str) -> bool {
        match &self.template.bound_party {
            Some(party) => text.to_lowercase().contains(&party.to_lowercase()),
            None => true,
        }
    }

    /// Fields read off `text` and the share of patterns that matched.
    fn apply(&self, text: &str) -> (ExtractedFields, f64) {
        let mut fields = ExtractedFields::default();
        if self.patterns.is_empty() {
            return (fields, 0.0);
        }

        let matched = self
            .patterns
            .iter()
            .filter(|(field, re)| {
                re.captures(text)
                    .and_then(|c| c.get(1))
                    .map(|m| apply_value(&mut fields, *field, m.as_str()))
                    .unwrap_or(false)
            })
            .count();

        (fields, matched as f64 / self.patterns.len() as f64)
    }
}

/// Store a captured value into `fields`; false when it does not parse.
fn apply_value(fields: &mut ExtractedFields, field: TemplateField, raw: &str) -> bool {
    fn set<T>(slot: &mut Option<T>, value: Option<T>) -> bool {
        let ok = value.is_some();
        if ok {
            *slot = value;
        }
        ok
    }

    match field {
        TemplateField::InvoiceNumber => set(&mut fields.invoice_number, clean_text(raw)),
        TemplateField::InvoiceDate => set(&mut fields.invoice_date, parse_date(raw)),
        TemplateField::DueDate => set(&mut fields.due_date, parse_date(raw)),
        TemplateField::CustomerName => set(&mut fields.customer.name, clean_text(raw)),
        TemplateField::CustomerUen => set(&mut fields.customer.uen, clean_text(raw)),
        TemplateField::CustomerAddress => set(&mut fields.customer.address, clean_text(raw)),
        TemplateField::VendorName => set(&mut fields.vendor.name, clean_text(raw)),
        TemplateField::VendorUen => set(&mut fields.vendor.uen, clean_text(raw)),
        TemplateField::VendorGstNumber => set(&mut fields.vendor.gst_registration_number, clean_text(raw)),
        TemplateField::VendorAddress => set(&mut fields.vendor.address, clean_text(raw)),
        TemplateField::Subtotal => set(&mut fields.subtotal, parse_amount(raw)),
        TemplateField::TaxAmount => set(&mut fields.tax_amount, parse_amount(raw)),
        TemplateField::TotalAmount => set(&mut fields.total_amount, parse_amount(raw)),
        TemplateField::Currency => set(&mut fields.currency, clean_text(raw).map(|c| c.to_ascii_uppercase())),
    }
}

#[derive(Debug, Clone)]
pub struct TemplateMatch {
    pub template_id: Uuid,
    pub template_name: String,
    pub fields: ExtractedFields,
    pub confidence: f64,
}

impl TemplateMatch {
    pub fn into_result(self, started: Instant) -> ExtractionResult {
        ExtractionResult::new(
            self.fields,
            self.confidence,
            format!("template:{}", self.template_name),
            started.elapsed(),
        )
    }
}

/// Pattern-based fast path over a ranked in-memory working set of templates.
pub struct TemplateMatcher {
    repository: Option<Arc<dyn TemplateRepository>>,
    working_set: RwLock<Vec<CompiledTemplate>>,
    capacity: usize,
}

impl TemplateMatcher {
    pub fn new(repository: Option<Arc<dyn TemplateRepository>>, capacity: usize) -> Self {
        TemplateMatcher {
            repository,
            working_set: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Load the top-ranked templates from the repository into the working set.
    pub async fn load(&self) -> StorageResult<usize> {
        let Some(repository) = &self.repository else {
            return Ok(0);
        };
        let templates = repository.load_templates(self.capacity).await?;
        let mut set = self.working_set.write().await;
        *set = templates.into_iter().map(CompiledTemplate::compile).collect();
        rank(&mut set);
        set.truncate(self.capacity);
        tracing::info!(templates = set.len(), "template working set loaded");
        Ok(set.len())
    }

    pub async fn len(&self) -> usize {
        self.working_set.read().await.len()
    }

    pub async fn templates(&self) -> Vec<Template> {
        self.working_set.read().await.iter().map(|c| c.template.clone()).collect()
    }

    /// Persist a new template and add it to the working set.
    pub async fn add(&self, template: Template) -> StorageResult<()> {
        if let Some(repository) = &self.repository {
            repository.save_template(&template).await?;
        }
        let mut set = self.working_set.write().await;
        set.retain(|c| c.template.id != template.id);
        set.push(CompiledTemplate::compile(template));
        rank(&mut set);
        set.truncate(self.capacity);
        Ok(())
    }

    /// Best template match for `text`. The winning template's usage is recorded.
    pub async fn match_text(&self, text: &str) -> Option<TemplateMatch> {
        let best = {
            let set = self.working_set.read().await;
            set.iter()
                .filter(|c| c.applies_to(text))
                .map(|c| {
                    let (fields, ratio) = c.apply(text);
                    TemplateMatch {
                        template_id: c.template.id,
                        template_name: c.template.name.clone(),
                        fields,
                        confidence: (c.template.confidence_prior * ratio).clamp(0.0, 1.0),
                    }
                })
                .filter(|m| m.confidence > 0.0)
                .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal))
        }?;

        self.record_usage(best.template_id).await;
        Some(best)
    }

    async fn record_usage(&self, id: Uuid) {
        let now = Utc::now();
        let usage_count = {
            let mut set = self.working_set.write().await;
            let Some(entry) = set.iter_mut().find(|c| c.template.id == id) else {
                return;
            };
            entry.template.usage_count += 1;
            entry.template.last_used_at = Some(now);
            let count = entry.template.usage_count;
            rank(&mut set);
            count
        };

        if let Some(repository) = &self.repository {
            if let Err(e) = repository.record_usage(id, usage_count, now).await {
                tracing::warn!(template = %id, error = %e, "failed to persist template usage");
            }
        }
    }
}

/// Most used first, ties broken by most recent use.
fn rank(set: &mut [CompiledTemplate]) {
    set.sort_by(|a, b| {
        b.template
            .usage_count
            .cmp(&a.template.usage_count)
            .then_with(|| b.template.last_used_at.cmp(&a.template.last_used_at))
    });
}
