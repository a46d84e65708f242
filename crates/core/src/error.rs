//! Error types for Tokenweave.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using Tokenweave's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for Tokenweave.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Request / Model Errors
    // =========================================================================
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // =========================================================================
    // Sandbox Errors
    // =========================================================================
    #[error("Script execution failed: {0}")]
    ScriptExecution(String),

    // =========================================================================
    // Tokenization Errors
    // =========================================================================
    #[error("Unique constraint violation: {0}")]
    UniqueViolation(String),

    #[error("failed to generate a unique token for transformer {transformer_id} in {attempts} attempts")]
    UniquenessExceeded { transformer_id: Uuid, attempts: u32 },

    // =========================================================================
    // Resolution Errors
    // =========================================================================
    #[error("Rate limit exceeded for access policy {0}")]
    RateLimited(Uuid),

    #[error("Result limit exceeded for access policy {0}")]
    ResultLimited(Uuid),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a script execution error.
    pub fn script_execution(msg: impl Into<String>) -> Self {
        Self::ScriptExecution(msg.into())
    }

    /// Create a unique constraint violation error.
    pub fn unique_violation(msg: impl Into<String>) -> Self {
        Self::UniqueViolation(msg.into())
    }

    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// True if this error signals a uniqueness conflict from the storage layer,
    /// which the tokenization retry loop treats as retryable.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }
}
