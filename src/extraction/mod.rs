pub mod enhance;
pub mod identifiers;
pub mod merge;
pub mod orchestrator;
pub mod parse;
pub mod scoring;
pub mod similarity;
pub mod text;

pub use enhance::Enhancer;
pub use merge::{merge_results, MergeConfig};
pub use orchestrator::{ExtractionOrchestrator, OrchestratorConfig};
pub use scoring::{consensus_confidence, score_fields};
