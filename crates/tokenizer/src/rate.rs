//! Sliding-window execution rate accounting.
//!
//! Executions are counted in one-second buckets keyed by (entity, subject).
//! A reservation sums the buckets inside the policy's window and either
//! claims a slot in the current bucket or reports the limit as hit.

use dashmap::DashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use tokenweave_core::{AccessPolicyContext, AccessPolicyThresholds, GLOBAL_RATE_SUBJECT};

type BucketKey = (Uuid, String, u64);

/// In-memory rate counter shared by all resolutions in a process.
#[derive(Default)]
pub struct RateCounter {
    buckets: DashMap<BucketKey, u64>,
}

impl RateCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve one execution slot for `subject` under `entity`. Returns false
    /// without reserving when the window is already at its limit.
    pub fn check_and_reserve(
        &self,
        thresholds: &AccessPolicyThresholds,
        entity: Uuid,
        subject: &str,
    ) -> bool {
        if !thresholds.has_rate_limit() {
            return true;
        }
        self.prune();
        let now = unix_now();
        let window = u64::from(thresholds.max_execution_duration_secs);
        let used: u64 = (now.saturating_sub(window.saturating_sub(1))..=now)
            .map(|bucket| {
                self.buckets
                    .get(&(entity, subject.to_string(), bucket))
                    .map(|count| *count)
                    .unwrap_or(0)
            })
            .sum();
        if used >= u64::from(thresholds.max_executions) {
            return false;
        }
        *self
            .buckets
            .entry((entity, subject.to_string(), now))
            .or_insert(0) += 1;
        true
    }

    /// Drop buckets older than the widest allowed window. Runs on every
    /// reservation so the map stays bounded by recent traffic.
    pub fn prune(&self) {
        let cutoff = unix_now().saturating_sub(60);
        self.buckets.retain(|(_, _, bucket), _| *bucket >= cutoff);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The subject a rate limit is scoped to: token subject claim first, then the
/// client connection, then a single global bucket.
pub fn rate_subject(context: &AccessPolicyContext) -> String {
    if let Some(sub) = context.server.claims.get("sub").and_then(|v| v.as_str()) {
        if !sub.is_empty() {
            return sub.to_string();
        }
    }
    if let Some(connection_id) = context.server.connection_id {
        return connection_id.to_string();
    }
    GLOBAL_RATE_SUBJECT.to_string()
}
