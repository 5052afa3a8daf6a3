use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::ServerConfig;
use crate::pipeline::Pipeline;
use crate::templates::TemplateMatcher;
use crate::validation::ValidationEngine;

pub type KeyedRateLimiter = Arc<RateLimiter<Uuid, DashMapStateStore<Uuid>, DefaultClock>>;

#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Pipeline,
    pub validator: Arc<ValidationEngine>,
    pub templates: Option<Arc<TemplateMatcher>>,
    pub submit_limiter: KeyedRateLimiter,
}

impl ApiState {
    pub fn new(
        pipeline: Pipeline,
        validator: Arc<ValidationEngine>,
        templates: Option<Arc<TemplateMatcher>>,
        server: &ServerConfig,
    ) -> Self {
        let per_minute = NonZeroU32::new(server.submissions_per_minute.max(1)).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(server.submission_burst.max(1)).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_minute(per_minute).allow_burst(burst);

        ApiState {
            pipeline,
            validator,
            templates,
            submit_limiter: Arc::new(RateLimiter::dashmap_with_clock(quota, &DefaultClock::default())),
        }
    }
}
