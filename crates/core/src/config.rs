//! Service configuration, loadable from a file plus `TOKENWEAVE__`-prefixed
//! environment variables.

use serde::Deserialize;

use crate::error::{Error, Result};

/// Sandbox pool and script resource limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum number of concurrently held script engines.
    pub pool_size: usize,
    /// Number of prior uses after which a pooled engine is discarded and
    /// rebuilt instead of being handed out again.
    pub max_engine_uses: u32,
    /// How long an acquire waits for a free engine before timing out.
    pub acquire_timeout_ms: u64,
    /// Operation budget per script invocation.
    pub max_operations: u64,
    /// Maximum script call stack depth.
    pub max_call_levels: usize,
    /// Maximum size of any string a script may build, in bytes.
    pub max_string_size: usize,
    /// Timeout for outbound HTTP requests made by scripts.
    pub http_timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            pool_size: 30,
            max_engine_uses: 9,
            acquire_timeout_ms: 5_000,
            max_operations: 500_000,
            max_call_levels: 32,
            max_string_size: 1_048_576,
            http_timeout_ms: 10_000,
        }
    }
}

/// Tokenization limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    /// Attempts to mint a non-conflicting token before giving up.
    pub max_uniqueness_attempts: u32,
    /// Maximum items per tokenization or resolution batch.
    pub max_token_batch: usize,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            max_uniqueness_attempts: 5,
            max_token_batch: 1_000,
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub sandbox: SandboxConfig,
    pub tokenizer: TokenizerConfig,
}

impl CoreConfig {
    /// Load configuration, layering an optional file under environment
    /// variables (`TOKENWEAVE__SANDBOX__POOL_SIZE=10`).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TOKENWEAVE").separator("__"),
        );
        let loaded = builder
            .build()
            .map_err(|e| Error::internal(format!("failed to load configuration: {e}")))?;
        loaded
            .try_deserialize()
            .map_err(|e| Error::validation(format!("invalid configuration: {e}")))
    }
}
