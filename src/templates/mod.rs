//! Template fast path: learned label-anchored patterns keyed to known document layouts.

pub mod learning;
pub mod matcher;

pub use learning::{learn_template, LEARNED_PRIOR};
pub use matcher::{TemplateMatch, TemplateMatcher};
