//! Full tokenize-then-resolve cycles through the public crate APIs.

use std::sync::Arc;

use tokenweave_core::config::{SandboxConfig, TokenizerConfig};
use tokenweave_core::mocks::{InMemoryStorage, MockAuthz};
use tokenweave_core::{AccessPolicyContext, Storage, TransformType, Transformer};
use tokenweave_policy::PolicyEvaluator;
use tokenweave_sandbox::{HostCapabilities, SandboxPool};
use tokenweave_tokenizer::{
    ExecuteTransformerParameters, RateCounter, ResolutionStatus, TokenResolver,
    TransformerExecutor,
};

struct Stack {
    storage: Arc<InMemoryStorage>,
    executor: TransformerExecutor,
    resolver: TokenResolver,
}

fn stack() -> Stack {
    let storage = Arc::new(InMemoryStorage::with_builtins());
    let authz = Arc::new(MockAuthz::allowing(true));
    let pool = SandboxPool::new(HostCapabilities::default(), SandboxConfig::default());
    let executor = TransformerExecutor::new(
        storage.clone(),
        Arc::clone(&pool),
        TokenizerConfig::default(),
    );
    let evaluator = PolicyEvaluator::new(storage.clone(), pool, authz);
    let resolver = TokenResolver::new(
        storage.clone(),
        evaluator,
        Arc::new(RateCounter::new()),
        &TokenizerConfig::default(),
    );
    Stack {
        storage,
        executor,
        resolver,
    }
}

fn email_tokenizer() -> Transformer {
    Transformer::new(
        "EmailToken",
        r#"fn transform(data, params) { "tok::" + data }"#,
        TransformType::TokenizeByValue,
    )
}

#[tokio::test]
async fn tokenize_then_resolve_round_trip() {
    let mut stack = stack();
    let policy = stack
        .storage
        .get_access_policy_by_name("AllowAll")
        .await
        .unwrap();

    let (tokens, _) = stack
        .executor
        .execute(vec![ExecuteTransformerParameters {
            transformer: email_tokenizer(),
            token_access_policy_id: Some(policy.id),
            data: "ada@example.com".into(),
            provenance: None,
        }])
        .await
        .unwrap();
    assert_eq!(tokens, vec!["tok::ada@example.com".to_string()]);
    stack.executor.cleanup_execution();

    let resolved = stack
        .resolver
        .resolve(&tokens, &AccessPolicyContext::default())
        .await
        .unwrap();
    assert_eq!(resolved[0].status, ResolutionStatus::Succeeded);
    assert_eq!(resolved[0].data, "ada@example.com");
}

#[tokio::test]
async fn deny_all_blocks_resolution_of_minted_tokens() {
    let mut stack = stack();
    let policy = stack
        .storage
        .get_access_policy_by_name("DenyAll")
        .await
        .unwrap();

    let (tokens, _) = stack
        .executor
        .execute(vec![ExecuteTransformerParameters {
            transformer: email_tokenizer(),
            token_access_policy_id: Some(policy.id),
            data: "ada@example.com".into(),
            provenance: None,
        }])
        .await
        .unwrap();

    let resolved = stack
        .resolver
        .resolve(&tokens, &AccessPolicyContext::default())
        .await
        .unwrap();
    assert_eq!(resolved[0].status, ResolutionStatus::Failed);
    assert_eq!(resolved[0].data, "");
}

#[tokio::test]
async fn mixed_policy_batch_resolves_per_policy() {
    let mut stack = stack();
    let allow = stack
        .storage
        .get_access_policy_by_name("AllowAll")
        .await
        .unwrap();
    let deny = stack
        .storage
        .get_access_policy_by_name("DenyAll")
        .await
        .unwrap();

    let transformer = email_tokenizer();
    let (tokens, _) = stack
        .executor
        .execute(vec![
            ExecuteTransformerParameters {
                transformer: transformer.clone(),
                token_access_policy_id: Some(allow.id),
                data: "open@example.com".into(),
                provenance: None,
            },
            ExecuteTransformerParameters {
                transformer,
                token_access_policy_id: Some(deny.id),
                data: "closed@example.com".into(),
                provenance: None,
            },
        ])
        .await
        .unwrap();

    let resolved = stack
        .resolver
        .resolve(&tokens, &AccessPolicyContext::default())
        .await
        .unwrap();
    assert_eq!(resolved[0].status, ResolutionStatus::Succeeded);
    assert_eq!(resolved[0].data, "open@example.com");
    assert_eq!(resolved[1].status, ResolutionStatus::Failed);
    assert_eq!(resolved[1].data, "");
}
