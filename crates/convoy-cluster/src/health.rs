//! Host health tracking.
//!
//! A host turns unhealthy when its event stream drops, when discovery
//! reports it down, or when a status check fails. Unhealthy hosts are
//! checked periodically; a single successful check restores them, and
//! `max_checks` consecutive failures mark them dead.

use tracing::{debug, warn};

/// Result of a single `GetStatus` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    Healthy,
    Failed,
}

/// What the scheduler should do with a host after a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    /// Still failing, below the threshold.
    Unhealthy,
    /// Threshold reached; unfollow the host.
    Dead,
}

/// Tracks consecutive failed checks for a single host.
#[derive(Debug, Clone)]
pub struct HostHealth {
    healthy: bool,
    /// Consecutive failed checks since the host was last healthy.
    consecutive_failures: u32,
    /// Failures before the host is declared dead.
    max_checks: u32,
}

impl HostHealth {
    /// A healthy tracker that declares the host dead after `max_checks`
    /// consecutive failures.
    pub fn new(max_checks: u32) -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            max_checks: max_checks.max(1),
        }
    }

    /// Mark unhealthy without counting a failed check.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    /// Record a check result and return the verdict.
    pub fn record(&mut self, result: CheckResult) -> HealthVerdict {
        match result {
            CheckResult::Healthy => {
                if !self.healthy {
                    debug!(failures = self.consecutive_failures, "host recovered");
                }
                self.healthy = true;
                self.consecutive_failures = 0;
                HealthVerdict::Healthy
            }
            CheckResult::Failed => {
                self.healthy = false;
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.max_checks {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.max_checks,
                        "host failed too many status checks"
                    );
                    HealthVerdict::Dead
                } else {
                    HealthVerdict::Unhealthy
                }
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_starts_healthy() {
        let health = HostHealth::new(10);
        assert!(health.is_healthy());
        assert_eq!(health.consecutive_failures(), 0);
    }

    #[test]
    fn mark_unhealthy_does_not_count_a_failure() {
        let mut health = HostHealth::new(3);
        health.mark_unhealthy();
        assert!(!health.is_healthy());
        assert_eq!(health.consecutive_failures(), 0);
    }

    #[test]
    fn dead_at_threshold() {
        let mut health = HostHealth::new(3);
        health.mark_unhealthy();
        assert_eq!(health.record(CheckResult::Failed), HealthVerdict::Unhealthy);
        assert_eq!(health.record(CheckResult::Failed), HealthVerdict::Unhealthy);
        assert_eq!(health.record(CheckResult::Failed), HealthVerdict::Dead);
    }

    #[test]
    fn success_resets_counter() {
        let mut health = HostHealth::new(3);
        health.record(CheckResult::Failed);
        health.record(CheckResult::Failed);

        assert_eq!(health.record(CheckResult::Healthy), HealthVerdict::Healthy);
        assert!(health.is_healthy());
        assert_eq!(health.consecutive_failures(), 0);

        // Counting starts over.
        health.record(CheckResult::Failed);
        assert_eq!(health.record(CheckResult::Failed), HealthVerdict::Unhealthy);
    }

    #[test]
    fn zero_threshold_is_clamped() {
        let mut health = HostHealth::new(0);
        assert_eq!(health.record(CheckResult::Failed), HealthVerdict::Dead);
    }
}
