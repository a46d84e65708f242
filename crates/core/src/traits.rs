//! Collaborator traits at the seams of the tokenization service.
//!
//! `Storage` is async and only ever called from host code. The remaining
//! traits are synchronous because sandboxed scripts invoke them mid-execution,
//! where no await point is available.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    AccessPolicy, AccessPolicyTemplate, DataProvenance, TokenRecord, Transformer,
};

/// Persistence for policies, templates, transformers, and token records.
///
/// `save_token_record` must fail with [`crate::Error::UniqueViolation`] when
/// the record's token collides with an existing token for the same
/// transformer, or when an equivalent record already exists for the same
/// (data or provenance, transformer, access policy) triple. The tokenization
/// retry loop depends on that signal.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_latest_access_policy(&self, id: Uuid) -> Result<AccessPolicy>;

    async fn get_access_policy_by_name(&self, name: &str) -> Result<AccessPolicy>;

    async fn get_latest_template(&self, id: Uuid) -> Result<AccessPolicyTemplate>;

    async fn get_latest_transformer(&self, id: Uuid) -> Result<Transformer>;

    /// Existing value tokens for `data` minted by this transformer under this
    /// access policy, newest first.
    async fn list_token_records_by_data_and_policy(
        &self,
        data: &str,
        transformer_id: Uuid,
        access_policy_id: Uuid,
    ) -> Result<Vec<TokenRecord>>;

    /// Existing reference tokens for `provenance` minted by this transformer
    /// under this access policy, newest first.
    async fn list_token_records_by_provenance_and_policy(
        &self,
        provenance: DataProvenance,
        transformer_id: Uuid,
        access_policy_id: Uuid,
    ) -> Result<Vec<TokenRecord>>;

    async fn list_token_records_by_tokens(&self, tokens: &[String]) -> Result<Vec<TokenRecord>>;

    async fn save_token_record(&self, record: &TokenRecord) -> Result<()>;
}

/// Attribute checks against the authorization service.
pub trait AuthzClient: Send + Sync {
    /// True when `attribute` connects object `id1` to object `id2`.
    fn check_attribute(&self, id1: Uuid, id2: Uuid, attribute: &str) -> Result<bool>;
}

/// Resolution of named secrets for sandboxed scripts.
pub trait SecretResolver: Send + Sync {
    fn resolve_secret(&self, name: &str) -> Result<String>;
}

/// A structured audit event.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub actor: String,
    pub event_type: String,
    pub payload: Value,
}

impl AuditEntry {
    pub fn new(actor: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            actor: actor.into(),
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Destination for audit events emitted by scripts and by token resolution.
pub trait AuditSink: Send + Sync {
    fn emit(&self, entry: AuditEntry);
}
