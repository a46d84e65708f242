//! Transformer execution counters and timings.

use std::time::Duration;
use uuid::Uuid;

pub(crate) fn transformer_executed(transformer_id: Uuid) {
    metrics::counter!(
        "transformer_executions_total",
        "transformer_id" => transformer_id.to_string()
    )
    .increment(1);
}

pub(crate) fn transformer_error(transformer_id: Uuid) {
    metrics::counter!(
        "transformer_execution_errors_total",
        "transformer_id" => transformer_id.to_string()
    )
    .increment(1);
}

pub(crate) fn token_conflict(transformer_id: Uuid) {
    metrics::counter!(
        "token_uniqueness_conflicts_total",
        "transformer_id" => transformer_id.to_string()
    )
    .increment(1);
}

pub(crate) fn transformer_duration(transformer_id: Uuid, elapsed: Duration) {
    if elapsed.is_zero() {
        return;
    }
    metrics::histogram!(
        "transformer_execution_seconds",
        "transformer_id" => transformer_id.to_string()
    )
    .record(elapsed.as_secs_f64());
}
