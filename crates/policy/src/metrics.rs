//! Evaluation counters and timings.

use std::time::Duration;
use uuid::Uuid;

pub(crate) fn evaluation_started(policy_id: Uuid) {
    metrics::counter!(
        "access_policy_evaluations_total",
        "policy_id" => policy_id.to_string()
    )
    .increment(1);
}

pub(crate) fn evaluation_error(policy_id: Uuid) {
    metrics::counter!(
        "access_policy_evaluation_errors_total",
        "policy_id" => policy_id.to_string()
    )
    .increment(1);
}

pub(crate) fn evaluation_result(policy_id: Uuid, allowed: bool) {
    metrics::counter!(
        "access_policy_evaluation_results_total",
        "policy_id" => policy_id.to_string(),
        "allowed" => allowed.to_string()
    )
    .increment(1);
}

pub(crate) fn evaluation_duration(policy_id: Uuid, elapsed: Duration) {
    if elapsed.is_zero() {
        return;
    }
    metrics::histogram!(
        "access_policy_evaluation_seconds",
        "policy_id" => policy_id.to_string()
    )
    .record(elapsed.as_secs_f64());
}
