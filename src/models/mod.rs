pub mod common;
pub mod extraction;
pub mod invoice;
pub mod job;
pub mod template;
pub mod validation;

pub use common::*;
pub use extraction::*;
pub use invoice::*;
pub use job::*;
pub use template::*;
pub use validation::*;
