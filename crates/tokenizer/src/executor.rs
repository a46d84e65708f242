//! Batched transformer execution.
//!
//! A batch may mix transformers and token access policies. Items are grouped
//! by the (transformer, token access policy) pair, each group runs through one
//! handler holding at most one sandbox engine, and results are returned in the
//! original batch order.

use rhai::serde::{from_dynamic, to_dynamic};
use rhai::Dynamic;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use tokenweave_core::config::TokenizerConfig;
use tokenweave_core::{
    AccessPolicy, DataProvenance, Error, Result, Storage, TokenRecord, TransformType, Transformer,
};
use tokenweave_sandbox::{EngineHandle, SandboxPool};

use crate::metrics;
use crate::native::{native_transformer, NativeTransformFn};

/// Name of the function every transformer script must expose.
pub const TRANSFORM_FUNCTION: &str = "transform";

/// One item of a transformer execution batch.
#[derive(Debug, Clone)]
pub struct ExecuteTransformerParameters {
    pub transformer: Transformer,
    /// Access policy gating resolution of the minted token. Required for
    /// tokenizing transformers, ignored otherwise.
    pub token_access_policy_id: Option<Uuid>,
    pub data: String,
    /// Origin reference for tokenize-by-reference transformers.
    pub provenance: Option<DataProvenance>,
}

/// Handlers are shared by all items naming the same transformer under the
/// same token access policy.
type HandlerKey = (Uuid, Uuid);

fn handler_key(item: &ExecuteTransformerParameters) -> HandlerKey {
    (
        item.transformer.id,
        item.token_access_policy_id.unwrap_or(Uuid::nil()),
    )
}

/// Executes batches of transformer invocations.
///
/// The executor is reusable across batches; handlers (and their sandbox
/// engines) persist until [`TransformerExecutor::cleanup_execution`].
pub struct TransformerExecutor {
    storage: Arc<dyn Storage>,
    pool: Arc<SandboxPool>,
    handlers: HashMap<HandlerKey, TransformerHandler>,
    config: TokenizerConfig,
}

impl TransformerExecutor {
    pub fn new(
        storage: Arc<dyn Storage>,
        pool: Arc<SandboxPool>,
        config: TokenizerConfig,
    ) -> Self {
        Self {
            storage,
            pool,
            handlers: HashMap::new(),
            config,
        }
    }

    /// Run a batch. Returns one output per item, in item order, plus the
    /// combined console output of every script that ran.
    pub async fn execute(
        &mut self,
        items: Vec<ExecuteTransformerParameters>,
    ) -> Result<(Vec<String>, String)> {
        if items.len() > self.config.max_token_batch {
            return Err(Error::validation(format!(
                "batch of {} items exceeds the limit of {}",
                items.len(),
                self.config.max_token_batch
            )));
        }
        self.reset();

        let total = items.len();
        let mut run_order: Vec<HandlerKey> = Vec::new();
        let mut indices_by_key: HashMap<HandlerKey, Vec<usize>> = HashMap::new();

        for (index, item) in items.into_iter().enumerate() {
            let key = handler_key(&item);
            if !self.handlers.contains_key(&key) {
                let handler = TransformerHandler::new(
                    Arc::clone(&self.storage),
                    Arc::clone(&self.pool),
                    item.transformer.clone(),
                    item.token_access_policy_id,
                    self.config.max_uniqueness_attempts,
                )
                .await?;
                self.handlers.insert(key, handler);
            }
            let Some(handler) = self.handlers.get_mut(&key) else {
                return Err(Error::internal("transformer handler vanished"));
            };
            handler.add(item.data, item.provenance)?;
            let indices = indices_by_key.entry(key).or_default();
            if indices.is_empty() {
                run_order.push(key);
            }
            indices.push(index);
        }

        let mut results = vec![String::new(); total];
        let mut console = String::new();
        for key in &run_order {
            let Some(handler) = self.handlers.get_mut(key) else {
                return Err(Error::internal("transformer handler vanished"));
            };
            let outputs = handler.execute().await?;
            let Some(indices) = indices_by_key.get(key) else {
                return Err(Error::internal("transformer batch index vanished"));
            };
            for (output, index) in outputs.into_iter().zip(indices) {
                results[*index] = output;
            }
            console.push_str(&handler.console_output());
        }
        Ok((results, console))
    }

    /// Drop per-batch data, keeping handlers and engines for reuse.
    pub fn reset(&mut self) {
        for handler in self.handlers.values_mut() {
            handler.reset();
        }
    }

    /// Release every handler's sandbox engine back to the pool.
    pub fn cleanup_execution(&mut self) {
        for handler in self.handlers.values_mut() {
            handler.reset();
            handler.cleanup();
        }
    }
}

// =============================================================================
// Per-group Handler
// =============================================================================

struct TransformerHandler {
    storage: Arc<dyn Storage>,
    pool: Arc<SandboxPool>,
    transformer: Transformer,
    native: Option<NativeTransformFn>,
    token_access_policy: Option<AccessPolicy>,
    engine: Option<EngineHandle>,
    data: Vec<String>,
    provenance: Vec<Option<DataProvenance>>,
    max_attempts: u32,
}

impl TransformerHandler {
    async fn new(
        storage: Arc<dyn Storage>,
        pool: Arc<SandboxPool>,
        transformer: Transformer,
        token_access_policy_id: Option<Uuid>,
        max_attempts: u32,
    ) -> Result<Self> {
        transformer.validate()?;
        let token_access_policy = if transformer.transform_type.is_tokenizing() {
            let Some(policy_id) = token_access_policy_id.filter(|id| !id.is_nil()) else {
                return Err(Error::validation(format!(
                    "transformer {} requires a token access policy",
                    transformer.name
                )));
            };
            Some(storage.get_latest_access_policy(policy_id).await?)
        } else {
            None
        };
        let native = native_transformer(transformer.id);
        Ok(Self {
            storage,
            pool,
            transformer,
            native,
            token_access_policy,
            engine: None,
            data: Vec::new(),
            provenance: Vec::new(),
            max_attempts,
        })
    }

    fn add(&mut self, data: String, provenance: Option<DataProvenance>) -> Result<()> {
        if self.transformer.transform_type == TransformType::TokenizeByReference
            && provenance.is_none()
        {
            return Err(Error::validation(format!(
                "transformer {} tokenizes by reference and requires data provenance",
                self.transformer.name
            )));
        }
        self.data.push(data);
        self.provenance.push(provenance);
        Ok(())
    }

    async fn execute(&mut self) -> Result<Vec<String>> {
        tracing::debug!(
            transformer_id = %self.transformer.id,
            transformer = %self.transformer.name,
            items = self.data.len(),
            "executing transformer"
        );
        metrics::transformer_executed(self.transformer.id);
        let started = Instant::now();

        let (mut results, unresolved) = self.lookup_existing().await?;
        if !unresolved.is_empty() {
            if self.native.is_none() && self.engine.is_none() {
                self.engine = Some(self.pool.acquire().await?);
            }
            if self.transformer.transform_type.is_tokenizing() {
                self.mint_tokens(&mut results, unresolved).await?;
            } else {
                for index in unresolved {
                    results[index] = self.transform(index)?;
                }
            }
        }

        metrics::transformer_duration(self.transformer.id, started.elapsed());
        Ok(results)
    }

    /// Fill results from existing tokens where the transformer allows reuse.
    /// Returns the indices still needing a transform.
    async fn lookup_existing(&self) -> Result<(Vec<String>, Vec<usize>)> {
        let mut results = vec![String::new(); self.data.len()];
        if !self.transformer.reuse_existing_token {
            return Ok((results, (0..self.data.len()).collect()));
        }
        let Some(policy) = &self.token_access_policy else {
            return Ok((results, (0..self.data.len()).collect()));
        };

        let mut unresolved = Vec::new();
        for index in 0..self.data.len() {
            let existing = match self.provenance[index] {
                Some(provenance) => {
                    self.storage
                        .list_token_records_by_provenance_and_policy(
                            provenance,
                            self.transformer.id,
                            policy.id,
                        )
                        .await?
                }
                None => {
                    self.storage
                        .list_token_records_by_data_and_policy(
                            &self.data[index],
                            self.transformer.id,
                            policy.id,
                        )
                        .await?
                }
            };
            match existing.first() {
                Some(record) => results[index] = record.token.clone(),
                None => unresolved.push(index),
            }
        }
        Ok((results, unresolved))
    }

    /// Transform and persist until every index has a unique token or the
    /// attempt budget runs out.
    async fn mint_tokens(&mut self, results: &mut [String], unresolved: Vec<usize>) -> Result<()> {
        let mut unresolved = unresolved;
        let mut attempt = 1;
        while !unresolved.is_empty() && attempt <= self.max_attempts {
            let mut remaining = Vec::new();
            for index in unresolved {
                let candidate = self.transform(index)?;
                if self.save(index, &candidate).await? {
                    results[index] = candidate;
                } else {
                    remaining.push(index);
                }
            }
            unresolved = remaining;
            attempt += 1;
        }
        if !unresolved.is_empty() {
            metrics::token_conflict(self.transformer.id);
            return Err(Error::UniquenessExceeded {
                transformer_id: self.transformer.id,
                attempts: self.max_attempts,
            });
        }
        Ok(())
    }

    fn transform(&self, index: usize) -> Result<String> {
        if let Some(native) = self.native {
            return Ok(native(&self.data[index], &self.transformer.parameters));
        }
        let Some(engine) = &self.engine else {
            return Err(Error::internal(format!(
                "no sandbox engine for transformer {}",
                self.transformer.id
            )));
        };

        let data = encode_data(&self.data[index]);
        let parameters: Value = if self.transformer.parameters.is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(&self.transformer.parameters)?
        };
        let args = vec![
            to_dynamic(&data).map_err(|e| Error::script_execution(e.to_string()))?,
            to_dynamic(&parameters).map_err(|e| Error::script_execution(e.to_string()))?,
        ];

        let result = engine
            .run_function(&self.transformer.function, TRANSFORM_FUNCTION, args)
            .map_err(|e| {
                metrics::transformer_error(self.transformer.id);
                e
            })?;
        dynamic_to_string(result)
    }

    /// Persist a candidate token. Returns false on a uniqueness conflict so
    /// the caller can retry with a fresh candidate.
    async fn save(&self, index: usize, token: &str) -> Result<bool> {
        let Some(policy) = &self.token_access_policy else {
            return Err(Error::internal(format!(
                "no token access policy for tokenizing transformer {}",
                self.transformer.id
            )));
        };
        let record = match self.provenance[index] {
            Some(provenance) => {
                TokenRecord::by_reference(token, provenance, &self.transformer, policy)
            }
            None => TokenRecord::by_value(token, &*self.data[index], &self.transformer, policy),
        };
        match self.storage.save_token_record(&record).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_unique_violation() => {
                tracing::warn!(
                    transformer_id = %self.transformer.id,
                    "token candidate collided, retrying"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn console_output(&self) -> String {
        self.engine
            .as_ref()
            .map(|engine| engine.console_output())
            .unwrap_or_default()
    }

    fn reset(&mut self) {
        self.data.clear();
        self.provenance.clear();
        if let Some(engine) = &self.engine {
            engine.clear_console();
        }
    }

    fn cleanup(&mut self) {
        self.engine = None;
    }
}

// =============================================================================
// Data Encoding
// =============================================================================

/// Scripts receive data as a JSON value. Structured input (an object, array,
/// or quoted string) passes through as-is; anything else is treated as a bare
/// string and quoted.
fn encode_data(data: &str) -> Value {
    match serde_json::from_str::<Value>(data) {
        Ok(value @ (Value::Object(_) | Value::Array(_) | Value::String(_))) => value,
        _ => Value::String(data.to_string()),
    }
}

fn dynamic_to_string(value: Dynamic) -> Result<String> {
    if value.is_string() {
        return value
            .into_string()
            .map_err(|t| Error::script_execution(format!("unexpected result type {t}")));
    }
    let json: Value = from_dynamic(&value).map_err(|e| Error::script_execution(e.to_string()))?;
    match json {
        Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenweave_core::config::SandboxConfig;
    use tokenweave_core::mocks::InMemoryStorage;
    use tokenweave_sandbox::HostCapabilities;

    fn executor_with(storage: Arc<InMemoryStorage>) -> TransformerExecutor {
        let pool = SandboxPool::new(HostCapabilities::default(), SandboxConfig::default());
        TransformerExecutor::new(storage, pool, TokenizerConfig::default())
    }

    fn echo_transformer() -> Transformer {
        Transformer::new(
            "Echo",
            "fn transform(data, params) { data }",
            TransformType::Transform,
        )
    }

    fn suffix_tokenizer(reuse: bool) -> Transformer {
        let mut transformer = Transformer::new(
            "Suffix",
            r#"fn transform(data, params) { data + "-tok" }"#,
            TransformType::TokenizeByValue,
        );
        transformer.reuse_existing_token = reuse;
        transformer
    }

    fn item(
        transformer: &Transformer,
        policy_id: Option<Uuid>,
        data: &str,
    ) -> ExecuteTransformerParameters {
        ExecuteTransformerParameters {
            transformer: transformer.clone(),
            token_access_policy_id: policy_id,
            data: data.to_string(),
            provenance: None,
        }
    }

    #[tokio::test]
    async fn transform_returns_script_output() {
        let storage = Arc::new(InMemoryStorage::with_builtins());
        let mut executor = executor_with(storage.clone());
        let (results, _) = executor
            .execute(vec![item(&echo_transformer(), None, "foo")])
            .await
            .unwrap();
        assert_eq!(results, vec!["foo".to_string()]);
        assert_eq!(storage.token_count(), 0);
    }

    #[tokio::test]
    async fn transform_passes_parameters() {
        let storage = Arc::new(InMemoryStorage::with_builtins());
        let mut executor = executor_with(storage);
        let mut transformer = Transformer::new(
            "Prefix",
            "fn transform(data, params) { params.prefix + data }",
            TransformType::Transform,
        );
        transformer.parameters = r#"{"prefix": "pre-"}"#.to_string();
        let (results, _) = executor
            .execute(vec![item(&transformer, None, "foo")])
            .await
            .unwrap();
        assert_eq!(results, vec!["pre-foo".to_string()]);
    }

    #[tokio::test]
    async fn structured_data_stays_structured() {
        let storage = Arc::new(InMemoryStorage::with_builtins());
        let mut executor = executor_with(storage);
        let transformer = Transformer::new(
            "Field",
            "fn transform(data, params) { data.name }",
            TransformType::Transform,
        );
        let (results, _) = executor
            .execute(vec![item(&transformer, None, r#"{"name": "ada"}"#)])
            .await
            .unwrap();
        assert_eq!(results, vec!["ada".to_string()]);
    }

    #[tokio::test]
    async fn tokenize_persists_a_record() {
        let storage = Arc::new(InMemoryStorage::with_builtins());
        let policy = storage.get_access_policy_by_name("AllowAll").await.unwrap();
        let mut executor = executor_with(storage.clone());

        let (results, _) = executor
            .execute(vec![item(&suffix_tokenizer(false), Some(policy.id), "foo")])
            .await
            .unwrap();
        assert_eq!(results, vec!["foo-tok".to_string()]);
        assert_eq!(storage.token_count(), 1);

        let records = storage
            .list_token_records_by_tokens(&["foo-tok".to_string()])
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, "foo");
        assert_eq!(records[0].access_policy_id, policy.id);
    }

    #[tokio::test]
    async fn reuse_returns_the_existing_token() {
        let storage = Arc::new(InMemoryStorage::with_builtins());
        let policy = storage.get_access_policy_by_name("AllowAll").await.unwrap();
        let transformer = suffix_tokenizer(true);

        let mut executor = executor_with(storage.clone());
        let (first, _) = executor
            .execute(vec![item(&transformer, Some(policy.id), "foo")])
            .await
            .unwrap();
        let (second, _) = executor
            .execute(vec![item(&transformer, Some(policy.id), "foo")])
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(storage.token_count(), 1);
        assert_eq!(storage.save_attempts(), 1);
    }

    #[tokio::test]
    async fn uniqueness_exhaustion_after_budgeted_attempts() {
        let storage = Arc::new(InMemoryStorage::with_builtins());
        let policy = storage.get_access_policy_by_name("AllowAll").await.unwrap();
        let mut executor = executor_with(storage.clone());

        // Always returns the same token, so the second data value can never
        // be minted.
        let constant = Transformer::new(
            "Constant",
            r#"fn transform(data, params) { "X" }"#,
            TransformType::TokenizeByValue,
        );
        let err = executor
            .execute(vec![
                item(&constant, Some(policy.id), "alpha"),
                item(&constant, Some(policy.id), "beta"),
            ])
            .await
            .unwrap_err();
        let Error::UniquenessExceeded {
            transformer_id,
            attempts,
        } = err
        else {
            panic!("expected uniqueness exhaustion, got {err}");
        };
        assert_eq!(transformer_id, constant.id);
        assert_eq!(attempts, 5);
        // One successful save for "alpha" plus five rejected attempts for "beta".
        assert_eq!(storage.save_attempts(), 6);
        assert_eq!(storage.token_count(), 1);
    }

    #[tokio::test]
    async fn mixed_batch_preserves_item_order() {
        let storage = Arc::new(InMemoryStorage::with_builtins());
        let policy = storage.get_access_policy_by_name("AllowAll").await.unwrap();
        let mut executor = executor_with(storage);

        let passthrough = Transformer::passthrough();
        let tokenizer = suffix_tokenizer(false);
        let (results, _) = executor
            .execute(vec![
                item(&passthrough, None, "a"),
                item(&tokenizer, Some(policy.id), "b"),
                item(&passthrough, None, "c"),
            ])
            .await
            .unwrap();
        assert_eq!(
            results,
            vec!["a".to_string(), "b-tok".to_string(), "c".to_string()]
        );
    }

    #[tokio::test]
    async fn native_uuid_transformer_mints_tokens() {
        let storage = Arc::new(InMemoryStorage::with_builtins());
        let policy = storage.get_access_policy_by_name("AllowAll").await.unwrap();
        let mut executor = executor_with(storage.clone());

        let transformer = Transformer::uuid_token();
        let (results, _) = executor
            .execute(vec![
                item(&transformer, Some(policy.id), "alpha"),
                item(&transformer, Some(policy.id), "beta"),
            ])
            .await
            .unwrap();
        assert_ne!(results[0], results[1]);
        assert!(Uuid::parse_str(&results[0]).is_ok());
        assert_eq!(storage.token_count(), 2);
    }

    #[tokio::test]
    async fn tokenizing_without_a_policy_is_rejected() {
        let storage = Arc::new(InMemoryStorage::with_builtins());
        let mut executor = executor_with(storage);
        let err = executor
            .execute(vec![item(&suffix_tokenizer(false), None, "foo")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn by_reference_requires_provenance() {
        let storage = Arc::new(InMemoryStorage::with_builtins());
        let policy = storage.get_access_policy_by_name("AllowAll").await.unwrap();
        let mut executor = executor_with(storage);

        let transformer = Transformer::new(
            "Ref",
            r#"fn transform(data, params) { data + "-ref" }"#,
            TransformType::TokenizeByReference,
        );
        let err = executor
            .execute(vec![item(&transformer, Some(policy.id), "foo")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn oversized_batches_are_rejected() {
        let storage = Arc::new(InMemoryStorage::with_builtins());
        let pool = SandboxPool::new(HostCapabilities::default(), SandboxConfig::default());
        let mut executor = TransformerExecutor::new(
            storage,
            pool,
            TokenizerConfig {
                max_token_batch: 2,
                ..Default::default()
            },
        );
        let transformer = echo_transformer();
        let err = executor
            .execute(vec![
                item(&transformer, None, "a"),
                item(&transformer, None, "b"),
                item(&transformer, None, "c"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn console_output_is_collected() {
        let storage = Arc::new(InMemoryStorage::with_builtins());
        let mut executor = executor_with(storage);
        let transformer = Transformer::new(
            "Noisy",
            r#"fn transform(data, params) { print("saw " + data); data }"#,
            TransformType::Transform,
        );
        let (_, console) = executor
            .execute(vec![item(&transformer, None, "x")])
            .await
            .unwrap();
        assert_eq!(console, "saw x\n");
    }

    #[tokio::test]
    async fn console_output_resets_between_batches() {
        let storage = Arc::new(InMemoryStorage::with_builtins());
        let mut executor = executor_with(storage);
        let transformer = Transformer::new(
            "Noisy",
            r#"fn transform(data, params) { print("saw " + data); data }"#,
            TransformType::Transform,
        );
        let (_, first) = executor
            .execute(vec![item(&transformer, None, "x")])
            .await
            .unwrap();
        assert_eq!(first, "saw x\n");

        // The handler keeps its engine; the second batch must not replay the
        // first batch's console.
        let (_, second) = executor
            .execute(vec![item(&transformer, None, "y")])
            .await
            .unwrap();
        assert_eq!(second, "saw y\n");
    }

    #[test]
    fn encode_data_quotes_bare_strings() {
        assert_eq!(encode_data("foo"), Value::String("foo".into()));
        assert_eq!(encode_data("5"), Value::String("5".into()));
        assert_eq!(
            encode_data(r#"{"a": 1}"#),
            serde_json::json!({"a": 1})
        );
        assert_eq!(encode_data("[1, 2]"), serde_json::json!([1, 2]));
        assert_eq!(encode_data(r#""quoted""#), Value::String("quoted".into()));
    }

    #[tokio::test]
    async fn distinct_policies_get_distinct_handlers() {
        let storage = Arc::new(InMemoryStorage::with_builtins());
        let allow = storage.get_access_policy_by_name("AllowAll").await.unwrap();
        let deny = storage.get_access_policy_by_name("DenyAll").await.unwrap();
        let mut executor = executor_with(storage.clone());

        let transformer = suffix_tokenizer(false);
        let err = executor
            .execute(vec![
                item(&transformer, Some(allow.id), "foo"),
                item(&transformer, Some(deny.id), "foo"),
            ])
            .await
            .unwrap_err();
        // Same transformer, same data, different policies: the second mint
        // collides on the token itself.
        assert!(matches!(err, Error::UniquenessExceeded { .. }));
    }
}
