use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::{PipelineError, PipelineResult, QuotaConfig};
use crate::storage::RecordStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub plan: String,
    pub usage: u64,
    /// `None` for unlimited plans.
    pub limit: Option<u64>,
}

/// Start of the calendar month containing `now`, in UTC.
pub fn billing_period_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Admission check against the owner's monthly plan limit.
pub struct QuotaGate {
    config: QuotaConfig,
    records: Arc<dyn RecordStore>,
}

impl QuotaGate {
    pub fn new(config: QuotaConfig, records: Arc<dyn RecordStore>) -> Self {
        QuotaGate { config, records }
    }

    fn limit_for(&self, plan: &str) -> Option<u64> {
        match self.config.plans.get(plan) {
            Some(limit) => *limit,
            None => self.config.plans.get(&self.config.default_plan).copied().flatten(),
        }
    }

    pub async fn usage(&self, owner: Uuid, now: DateTime<Utc>) -> PipelineResult<QuotaUsage> {
        let plan = self
            .records
            .owner_plan(owner)
            .await?
            .unwrap_or_else(|| self.config.default_plan.clone());
        let usage = self.records.count_invoices_since(owner, billing_period_start(now)).await?;
        Ok(QuotaUsage {
            limit: self.limit_for(&plan),
            plan,
            usage,
        })
    }

    /// Rejects with `QuotaExceeded` when the owner has used the whole period allowance.
    pub async fn check(&self, owner: Uuid) -> PipelineResult<QuotaUsage> {
        let usage = self.usage(owner, Utc::now()).await?;
        if let Some(limit) = usage.limit {
            if usage.usage >= limit {
                return Err(PipelineError::QuotaExceeded {
                    usage: usage.usage,
                    limit,
                });
            }
        }
        Ok(usage)
    }
}
