//! Backoff schedules and cancellable waits shared by fetch, commit and
//! guarded-policy retries.

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tokio_util::sync::CancellationToken;

/// Doubling backoff starting at `base`, capped at `max`, without jitter and
/// without an elapsed-time limit (callers bound attempts themselves).
pub fn exponential(base: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(base)
        .with_multiplier(2.0)
        .with_randomization_factor(0.0)
        .with_max_interval(max.max(base))
        .with_max_elapsed_time(None)
        .build()
}

/// Sleep for `duration` unless cancelled first. Returns false on cancel.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
