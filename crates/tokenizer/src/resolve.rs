//! Token resolution: tokens back to data, gated by access policies.
//!
//! Each distinct access policy in a batch is evaluated exactly once, and the
//! resulting status is shared by every token the policy gates. Rate limits
//! are charged per policy evaluation, not per token; result limits count
//! successful resolutions within the batch and flip later items to
//! `ResultLimited` once the cap is crossed.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use tokenweave_core::config::TokenizerConfig;
use tokenweave_core::{
    ids, AccessPolicy, AccessPolicyContext, AuditEntry, AuditSink, Error, Result, Storage,
};
use tokenweave_policy::PolicyEvaluator;

use crate::rate::{rate_subject, RateCounter};

/// Outcome of resolving one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStatus {
    Succeeded,
    RateLimited,
    Failed,
    ResultLimited,
}

/// One resolved (or denied) token.
///
/// `data` is empty unless the status is `Succeeded`. Reference tokens also
/// resolve with empty data here; fetching the live value behind their
/// provenance belongs to the data store layer.
#[derive(Debug, Clone)]
pub struct ResolvedToken {
    pub token: String,
    pub data: String,
    pub status: ResolutionStatus,
}

struct PolicyAccounting {
    policy: AccessPolicy,
    status: ResolutionStatus,
    resolved: u64,
}

/// Resolves batches of tokens.
pub struct TokenResolver {
    storage: Arc<dyn Storage>,
    evaluator: PolicyEvaluator,
    rate: Arc<RateCounter>,
    audit: Option<Arc<dyn AuditSink>>,
    max_batch: usize,
}

impl TokenResolver {
    pub fn new(
        storage: Arc<dyn Storage>,
        evaluator: PolicyEvaluator,
        rate: Arc<RateCounter>,
        config: &TokenizerConfig,
    ) -> Self {
        Self {
            storage,
            evaluator,
            rate,
            audit: None,
            max_batch: config.max_token_batch,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Resolve `tokens`, one result per input token in input order. Duplicate
    /// tokens share one result and are counted once against result limits.
    pub async fn resolve(
        &self,
        tokens: &[String],
        context: &AccessPolicyContext,
    ) -> Result<Vec<ResolvedToken>> {
        if tokens.len() > self.max_batch {
            return Err(Error::validation(format!(
                "batch of {} tokens exceeds the limit of {}",
                tokens.len(),
                self.max_batch
            )));
        }
        tracing::debug!(tokens = tokens.len(), "resolving token batch");

        let records = self.storage.list_token_records_by_tokens(tokens).await?;
        let mut record_by_token = HashMap::new();
        for record in &records {
            record_by_token.entry(record.token.as_str()).or_insert(record);
        }

        let mut accounting: HashMap<Uuid, PolicyAccounting> = HashMap::new();
        let mut resolved_by_token: HashMap<&str, ResolvedToken> = HashMap::new();
        for token in tokens {
            if resolved_by_token.contains_key(token.as_str()) {
                continue;
            }
            let resolved = match record_by_token.get(token.as_str()) {
                None => ResolvedToken {
                    token: token.clone(),
                    data: String::new(),
                    status: ResolutionStatus::Failed,
                },
                Some(record) => {
                    let policy_id = record.access_policy_id;
                    if !accounting.contains_key(&policy_id) {
                        let info = self.evaluate_policy(policy_id, context).await?;
                        accounting.insert(policy_id, info);
                    }
                    let Some(info) = accounting.get_mut(&policy_id) else {
                        return Err(Error::internal("policy accounting vanished"));
                    };
                    match info.status {
                        ResolutionStatus::Succeeded => {
                            if info.policy.thresholds.within_result_threshold(info.resolved + 1) {
                                info.resolved += 1;
                                ResolvedToken {
                                    token: token.clone(),
                                    data: record.data.clone(),
                                    status: ResolutionStatus::Succeeded,
                                }
                            } else {
                                info.status = ResolutionStatus::ResultLimited;
                                if info.policy.thresholds.announce_max_result_failure {
                                    return Err(Error::ResultLimited(policy_id));
                                }
                                ResolvedToken {
                                    token: token.clone(),
                                    data: String::new(),
                                    status: ResolutionStatus::ResultLimited,
                                }
                            }
                        }
                        status => ResolvedToken {
                            token: token.clone(),
                            data: String::new(),
                            status,
                        },
                    }
                }
            };
            resolved_by_token.insert(token.as_str(), resolved);
        }

        let results: Vec<ResolvedToken> = tokens
            .iter()
            .filter_map(|token| resolved_by_token.get(token.as_str()).cloned())
            .collect();
        self.audit_resolution(context, &results);
        Ok(results)
    }

    /// Charge the rate limit and evaluate the gating policy once.
    async fn evaluate_policy(
        &self,
        policy_id: Uuid,
        context: &AccessPolicyContext,
    ) -> Result<PolicyAccounting> {
        let policy = self.storage.get_latest_access_policy(policy_id).await?;
        let subject = rate_subject(context);
        let status = if !self
            .rate
            .check_and_reserve(&policy.thresholds, ids::TOKEN_RESOLUTION, &subject)
        {
            if policy.thresholds.announce_max_execution_failure {
                return Err(Error::RateLimited(policy_id));
            }
            ResolutionStatus::RateLimited
        } else if self.evaluator.evaluate(&policy, context).await? {
            ResolutionStatus::Succeeded
        } else {
            ResolutionStatus::Failed
        };
        Ok(PolicyAccounting {
            policy,
            status,
            resolved: 0,
        })
    }

    fn audit_resolution(&self, context: &AccessPolicyContext, results: &[ResolvedToken]) {
        let Some(audit) = self.audit.as_ref() else {
            return;
        };
        let count = |status: ResolutionStatus| {
            results.iter().filter(|r| r.status == status).count()
        };
        audit.emit(AuditEntry::new(
            rate_subject(context),
            "resolve_tokens",
            json!({
                "requested": results.len(),
                "succeeded": count(ResolutionStatus::Succeeded),
                "failed": count(ResolutionStatus::Failed),
                "rate_limited": count(ResolutionStatus::RateLimited),
                "result_limited": count(ResolutionStatus::ResultLimited),
            }),
        ));
    }
}
