//! In-memory doubles for the collaborator traits, used in tests throughout
//! the workspace.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    AccessPolicy, AccessPolicyTemplate, DataProvenance, TokenRecord, Transformer,
};
use crate::traits::{AuditEntry, AuditSink, AuthzClient, SecretResolver, Storage};

/// In-memory `Storage` with versioned objects and real uniqueness enforcement
/// on token records.
#[derive(Default)]
pub struct InMemoryStorage {
    policies: DashMap<Uuid, Vec<AccessPolicy>>,
    templates: DashMap<Uuid, Vec<AccessPolicyTemplate>>,
    transformers: DashMap<Uuid, Vec<Transformer>>,
    tokens: Mutex<Vec<TokenRecord>>,
    save_attempts: AtomicUsize,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-seeded with the built-in templates, transformers, and the
    /// AllowAll / DenyAll policies.
    pub fn with_builtins() -> Self {
        let storage = Self::new();
        storage.add_template(AccessPolicyTemplate::allow_all());
        storage.add_template(AccessPolicyTemplate::deny_all());
        storage.add_template(AccessPolicyTemplate::check_attribute());
        storage.add_transformer(Transformer::passthrough());
        storage.add_transformer(Transformer::uuid_token());
        storage.add_access_policy(AccessPolicy::allow_all());
        storage.add_access_policy(AccessPolicy::deny_all());
        storage
    }

    /// Add a new version of an access policy.
    pub fn add_access_policy(&self, policy: AccessPolicy) {
        self.policies.entry(policy.id).or_default().push(policy);
    }

    pub fn add_template(&self, template: AccessPolicyTemplate) {
        self.templates.entry(template.id).or_default().push(template);
    }

    pub fn add_transformer(&self, transformer: Transformer) {
        self.transformers
            .entry(transformer.id)
            .or_default()
            .push(transformer);
    }

    /// Number of times `save_token_record` was called, counting rejected saves.
    pub fn save_attempts(&self) -> usize {
        self.save_attempts.load(Ordering::SeqCst)
    }

    pub fn token_count(&self) -> usize {
        self.tokens.lock().map(|tokens| tokens.len()).unwrap_or(0)
    }
}

fn latest_version<T: Clone>(versions: &[T], version_of: impl Fn(&T) -> i32) -> Option<T> {
    versions.iter().max_by_key(|v| version_of(v)).cloned()
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get_latest_access_policy(&self, id: Uuid) -> Result<AccessPolicy> {
        self.policies
            .get(&id)
            .and_then(|versions| latest_version(&versions, |p| p.version))
            .ok_or_else(|| Error::not_found(format!("access policy {id}")))
    }

    async fn get_access_policy_by_name(&self, name: &str) -> Result<AccessPolicy> {
        self.policies
            .iter()
            .filter_map(|entry| latest_version(&entry, |p| p.version))
            .find(|p| p.name == name)
            .ok_or_else(|| Error::not_found(format!("access policy named {name}")))
    }

    async fn get_latest_template(&self, id: Uuid) -> Result<AccessPolicyTemplate> {
        self.templates
            .get(&id)
            .and_then(|versions| latest_version(&versions, |t| t.version))
            .ok_or_else(|| Error::not_found(format!("access policy template {id}")))
    }

    async fn get_latest_transformer(&self, id: Uuid) -> Result<Transformer> {
        self.transformers
            .get(&id)
            .and_then(|versions| latest_version(&versions, |t| t.version))
            .ok_or_else(|| Error::not_found(format!("transformer {id}")))
    }

    async fn list_token_records_by_data_and_policy(
        &self,
        data: &str,
        transformer_id: Uuid,
        access_policy_id: Uuid,
    ) -> Result<Vec<TokenRecord>> {
        let tokens = self
            .tokens
            .lock()
            .map_err(|_| Error::storage("token store poisoned"))?;
        Ok(tokens
            .iter()
            .rev()
            .filter(|r| {
                r.data == data
                    && r.provenance.is_none()
                    && r.transformer_id == transformer_id
                    && r.access_policy_id == access_policy_id
            })
            .cloned()
            .collect())
    }

    async fn list_token_records_by_provenance_and_policy(
        &self,
        provenance: DataProvenance,
        transformer_id: Uuid,
        access_policy_id: Uuid,
    ) -> Result<Vec<TokenRecord>> {
        let tokens = self
            .tokens
            .lock()
            .map_err(|_| Error::storage("token store poisoned"))?;
        Ok(tokens
            .iter()
            .rev()
            .filter(|r| {
                r.provenance == Some(provenance)
                    && r.transformer_id == transformer_id
                    && r.access_policy_id == access_policy_id
            })
            .cloned()
            .collect())
    }

    async fn list_token_records_by_tokens(&self, tokens: &[String]) -> Result<Vec<TokenRecord>> {
        let stored = self
            .tokens
            .lock()
            .map_err(|_| Error::storage("token store poisoned"))?;
        Ok(stored
            .iter()
            .filter(|r| tokens.iter().any(|t| *t == r.token))
            .cloned()
            .collect())
    }

    async fn save_token_record(&self, record: &TokenRecord) -> Result<()> {
        record.validate()?;
        self.save_attempts.fetch_add(1, Ordering::SeqCst);
        let mut tokens = self
            .tokens
            .lock()
            .map_err(|_| Error::storage("token store poisoned"))?;
        for existing in tokens.iter() {
            if existing.id == record.id {
                continue;
            }
            if existing.token == record.token && existing.transformer_id == record.transformer_id {
                return Err(Error::unique_violation(format!(
                    "token {} already exists for transformer {}",
                    record.token, record.transformer_id
                )));
            }
            let same_source = if record.provenance.is_some() {
                existing.provenance == record.provenance
            } else {
                !record.data.is_empty() && existing.data == record.data
            };
            if same_source
                && existing.transformer_id == record.transformer_id
                && existing.access_policy_id == record.access_policy_id
            {
                return Err(Error::unique_violation(format!(
                    "a token already exists for this data under transformer {} and access policy {}",
                    record.transformer_id, record.access_policy_id
                )));
            }
        }
        tokens.push(record.clone());
        Ok(())
    }
}

/// `AuthzClient` returning a fixed answer and counting calls.
pub struct MockAuthz {
    result: bool,
    calls: AtomicUsize,
}

impl MockAuthz {
    pub fn allowing(result: bool) -> Self {
        Self {
            result,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AuthzClient for MockAuthz {
    fn check_attribute(&self, _id1: Uuid, _id2: Uuid, _attribute: &str) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result)
    }
}

/// `SecretResolver` backed by a fixed map.
#[derive(Default)]
pub struct StaticSecrets {
    secrets: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

impl SecretResolver for StaticSecrets {
    fn resolve_secret(&self, name: &str) -> Result<String> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("secret {name}")))
    }
}

/// `AuditSink` that records every entry for later inspection.
#[derive(Default)]
pub struct RecordingAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for RecordingAuditSink {
    fn emit(&self, entry: AuditEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}
