//! Compliance validation: rule groups, scoring and auto-fix.

pub mod autofix;
pub mod engine;
pub mod rules;
pub mod totals;

pub use autofix::{auto_fix, AppliedFix, AutoFixOutcome};
pub use engine::ValidationEngine;
