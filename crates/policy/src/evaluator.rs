//! Recursive access policy evaluation.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use serde_json::json;
use tokenweave_core::{
    AccessPolicy, AccessPolicyComponent, AccessPolicyContext, AuditEntry, AuditSink, AuthzClient,
    PolicyType, Result, Storage,
};
use tokenweave_sandbox::SandboxPool;

use crate::metrics;
use crate::template::TemplateExecutor;

/// Evaluates composite access policies against an evaluation context.
///
/// Composition references are resolved to their latest stored version at
/// evaluation time, so a policy that nests another always sees its current
/// components.
pub struct PolicyEvaluator {
    storage: Arc<dyn Storage>,
    pool: Arc<SandboxPool>,
    authz: Arc<dyn AuthzClient>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl PolicyEvaluator {
    pub fn new(
        storage: Arc<dyn Storage>,
        pool: Arc<SandboxPool>,
        authz: Arc<dyn AuthzClient>,
    ) -> Self {
        Self {
            storage,
            pool,
            authz,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Evaluate `policy` with a fresh template executor, releasing any
    /// acquired sandbox engine before returning.
    pub async fn evaluate(
        &self,
        policy: &AccessPolicy,
        context: &AccessPolicyContext,
    ) -> Result<bool> {
        self.evaluate_with_output(policy, context)
            .await
            .map(|(allowed, _)| allowed)
    }

    /// Like [`Self::evaluate`], also returning whatever the policy's template
    /// scripts printed. Used by dry-run policy testing.
    pub async fn evaluate_with_output(
        &self,
        policy: &AccessPolicy,
        context: &AccessPolicyContext,
    ) -> Result<(bool, String)> {
        let mut executor = TemplateExecutor::new(Arc::clone(&self.pool), Arc::clone(&self.authz));
        let result = self
            .evaluate_with_executor(policy, context, &mut executor)
            .await;
        let console = executor.console_output();
        executor.cleanup();
        let allowed = result?;
        if let Some(audit) = self.audit.as_ref() {
            audit.emit(AuditEntry::new(
                "policy",
                "access_policy_evaluated",
                json!({
                    "policy_id": policy.id,
                    "policy": policy.name,
                    "allowed": allowed,
                }),
            ));
        }
        Ok((allowed, console))
    }

    /// Evaluate using a caller-provided executor, sharing its sandbox engine
    /// with other evaluations in the same request.
    pub async fn evaluate_with_executor(
        &self,
        policy: &AccessPolicy,
        context: &AccessPolicyContext,
        executor: &mut TemplateExecutor,
    ) -> Result<bool> {
        let serialized = serde_json::to_string(context)?;
        self.evaluate_inner(policy, context, &serialized, executor)
            .await
    }

    /// Recursive evaluation step. Boxed because the future type would
    /// otherwise be infinitely sized.
    fn evaluate_inner<'a>(
        &'a self,
        policy: &'a AccessPolicy,
        context: &'a AccessPolicyContext,
        serialized_context: &'a str,
        executor: &'a mut TemplateExecutor,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            tracing::debug!(policy_id = %policy.id, policy = %policy.name, "evaluating access policy");
            metrics::evaluation_started(policy.id);
            let started = Instant::now();

            let mut allowed = false;
            for component in &policy.components {
                allowed = match component {
                    AccessPolicyComponent::Policy { id } => {
                        let nested = match self.fetch(*id).await {
                            Ok(nested) => nested,
                            Err(e) => {
                                metrics::evaluation_error(policy.id);
                                return Err(e);
                            }
                        };
                        self.evaluate_inner(&nested, context, serialized_context, executor)
                            .await?
                    }
                    AccessPolicyComponent::Template { id, parameters } => {
                        let template = match self.storage.get_latest_template(*id).await {
                            Ok(template) => template,
                            Err(e) => {
                                metrics::evaluation_error(policy.id);
                                return Err(e);
                            }
                        };
                        match executor
                            .execute(&template, context, serialized_context, parameters)
                            .await
                        {
                            Ok(allowed) => allowed,
                            Err(e) => {
                                metrics::evaluation_error(policy.id);
                                return Err(e);
                            }
                        }
                    }
                };

                // Short-circuit: one true component settles an OR, one false
                // component settles an AND.
                if allowed {
                    if policy.policy_type == PolicyType::CompositeOr {
                        break;
                    }
                } else if policy.policy_type == PolicyType::CompositeAnd {
                    break;
                }
            }

            metrics::evaluation_result(policy.id, allowed);
            metrics::evaluation_duration(policy.id, started.elapsed());
            Ok(allowed)
        })
    }

    async fn fetch(&self, id: Uuid) -> Result<AccessPolicy> {
        self.storage.get_latest_access_policy(id).await
    }
}
