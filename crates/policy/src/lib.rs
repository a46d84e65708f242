#![deny(unused)]
//! Access policy evaluation for Tokenweave.
//!
//! Policies are boolean compositions of templates and other policies. This
//! crate evaluates them recursively with exact short-circuiting, runs
//! tenant-authored template scripts through the sandbox pool, and validates
//! compositions for cycles before they are accepted.

pub mod compose;
pub mod evaluator;
mod metrics;
pub mod template;

pub use compose::validate_composition;
pub use evaluator::PolicyEvaluator;
pub use template::TemplateExecutor;
