//! Restart back-off.
//!
//! A crashed job is replaced by a new job whose restart count is one more
//! than its predecessor's, or 1 if the predecessor ran for at least the
//! back-off period. The replacement waits `base * 2^(restarts - 1)`,
//! capped at 32 × base.

use std::time::{Duration, Instant};

use convoy_state::Job;

/// Largest back-off exponent (32 × base).
const MAX_EXPONENT: u32 = 5;

/// Delay before starting a job with the given restart count.
pub fn restart_delay(base: Duration, restarts: u32) -> Duration {
    if restarts == 0 {
        return Duration::ZERO;
    }
    let exponent = (restarts - 1).min(MAX_EXPONENT);
    base.saturating_mul(1 << exponent)
}

/// Restart count and delay for the replacement of a crashed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPlan {
    pub restarts: u32,
    pub delay: Duration,
}

/// Plan the replacement of `crashed` at `now`.
pub fn plan_restart(base: Duration, crashed: &Job, now: Instant) -> RestartPlan {
    let ran_long = crashed
        .started_at
        .is_some_and(|started| now.saturating_duration_since(started) >= base);
    let previous = if ran_long { 0 } else { crashed.restarts };
    let restarts = previous.saturating_add(1);
    RestartPlan {
        restarts,
        delay: restart_delay(base, restarts),
    }
}
