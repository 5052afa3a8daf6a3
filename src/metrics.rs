//! Prometheus metrics on the default registry, served at `GET /metrics`.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter, IntCounterVec,
};

pub static JOBS_SUBMITTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("invoice_jobs_submitted_total", "Jobs accepted into the queue")
        .expect("metric can be registered")
});

pub static JOBS_COMPLETED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("invoice_jobs_completed_total", "Jobs that reached completed")
        .expect("metric can be registered")
});

pub static JOBS_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("invoice_jobs_failed_total", "Jobs that failed terminally")
        .expect("metric can be registered")
});

pub static JOBS_RETRIED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("invoice_jobs_retried_total", "Job attempts re-queued after a transient failure")
        .expect("metric can be registered")
});

pub static QUOTA_REJECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("invoice_quota_rejections_total", "Submissions rejected by the plan quota")
        .expect("metric can be registered")
});

pub static PROVIDER_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "invoice_provider_calls_total",
        "Extraction provider calls by provider and outcome",
        &["provider", "outcome"]
    )
    .expect("metric can be registered")
});

pub static EXTRACTION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "invoice_extraction_duration_seconds",
        "Wall time of a full extraction",
        vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .expect("metric can be registered")
});

pub fn provider_call(provider: &str, outcome: &str) {
    PROVIDER_CALLS.with_label_values(&[provider, outcome]).inc();
}

/// Force registration so every series shows up on the first scrape.
pub fn init() {
    Lazy::force(&JOBS_SUBMITTED);
    Lazy::force(&JOBS_COMPLETED);
    Lazy::force(&JOBS_FAILED);
    Lazy::force(&JOBS_RETRIED);
    Lazy::force(&QUOTA_REJECTIONS);
    Lazy::force(&PROVIDER_CALLS);
    Lazy::force(&EXTRACTION_SECONDS);
}
