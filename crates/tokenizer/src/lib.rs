#![deny(unused)]
//! Tokenization and token resolution for Tokenweave.
//!
//! Transformers turn data into tokens (or transformed values) inside the
//! sandbox, with storage-enforced token uniqueness and bounded retry.
//! Resolution maps tokens back to data, gated by each token's access policy
//! and the policy's rate and result thresholds.

pub mod executor;
mod metrics;
pub mod native;
pub mod rate;
pub mod resolve;

pub use executor::{ExecuteTransformerParameters, TransformerExecutor};
pub use rate::RateCounter;
pub use resolve::{ResolutionStatus, ResolvedToken, TokenResolver};
