//! Small helpers shared by the transports.

use std::time::Duration;

use rand::Rng;

/// Uniformly random integer in `low..=high`. Swaps bounds given in reverse.
pub fn random_between(low: u32, high: u32) -> u32 {
    let (low, high) = if low <= high { (low, high) } else { (high, low) };
    rand::rng().random_range(low..=high)
}

/// Linear backoff: the n-th retry (0-based) waits `(n + 1) * step`.
pub fn backoff(attempt: u32, step: Duration) -> Duration {
    step.saturating_mul(attempt.saturating_add(1))
}

/// Give other tasks on this runtime a chance to run, e.g. to drain queued
/// medium notifications before acting on possibly stale state.
pub async fn settle() {
    tokio::task::yield_now().await;
}
