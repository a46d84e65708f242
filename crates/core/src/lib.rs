#![deny(unused)]
//! Core types, traits, and error definitions for Tokenweave.
//!
//! This crate provides the foundational building blocks shared across all layers
//! of the tokenization service.

pub mod config;
pub mod error;
pub mod mocks;
pub mod models;
pub mod traits;

pub use error::{Error, Result};
pub use models::*;
pub use traits::*;
