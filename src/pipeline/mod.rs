//! Asynchronous job pipeline: admission control, a priority queue, bounded workers,
//! per-checkpoint progress, retries with exponential backoff and cancellation.

pub mod cancel;
pub mod queue;
pub mod quota;
pub mod registry;
pub mod retry;
pub mod service;
pub mod state;
pub mod worker;

pub use cancel::CancelToken;
pub use quota::{QuotaGate, QuotaUsage};
pub use retry::RetryPolicy;
pub use service::{Pipeline, PipelineDeps};
