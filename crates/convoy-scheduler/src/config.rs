//! Scheduler configuration.
//!
//! Every tunable lives in [`SchedulerConfig`], passed in at construction.
//! The only value read from the environment is `BACKOFF_PERIOD`.

use std::time::Duration;

use crate::error::{SchedulerError, SchedulerResult};

/// Environment variable overriding the restart back-off base period.
pub const BACKOFF_PERIOD_ENV: &str = "BACKOFF_PERIOD";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Base restart delay; also how long a job must run to reset its
    /// restart counter.
    pub backoff_period: Duration,
    /// Consecutive failed status checks before a host is unfollowed.
    pub max_host_checks: u32,
    /// Interval between status checks of unhealthy hosts.
    pub host_check_interval: Duration,
    /// Placement attempts per job request before it is abandoned.
    pub placement_attempts: u32,
    /// Delay before a failed placement is retried.
    pub placement_retry_delay: Duration,
    /// Delay between reconnects of host, discovery and formation streams.
    pub stream_retry_delay: Duration,
    pub sync_jobs_interval: Duration,
    pub sync_formations_interval: Duration,
    pub sync_hosts_interval: Duration,
    /// Delay before a failed sync is retried.
    pub sync_retry_delay: Duration,
    /// How long startup waits for the initial host and formation snapshots.
    pub startup_timeout: Duration,
    /// Timeout applied to every host RPC.
    pub rpc_timeout: Duration,
    pub persist_retry_delay: Duration,
    /// Total time a job write is retried before it is dropped.
    pub persist_retry_total: Duration,
    /// Capacity of every input channel of the event pump.
    pub channel_capacity: usize,
    /// Default capacity of subscriber channels.
    pub subscriber_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backoff_period: Duration::from_secs(10 * 60),
            max_host_checks: 10,
            host_check_interval: Duration::from_secs(1),
            placement_attempts: 30,
            placement_retry_delay: Duration::from_millis(500),
            stream_retry_delay: Duration::from_millis(100),
            sync_jobs_interval: Duration::from_secs(30),
            sync_formations_interval: Duration::from_secs(60),
            sync_hosts_interval: Duration::from_secs(10),
            sync_retry_delay: Duration::from_millis(100),
            startup_timeout: Duration::from_secs(30),
            rpc_timeout: Duration::from_secs(5),
            persist_retry_delay: Duration::from_millis(100),
            persist_retry_total: Duration::from_secs(60),
            channel_capacity: 1000,
            subscriber_capacity: 1000,
        }
    }
}

impl SchedulerConfig {
    /// Defaults overlaid with values from the process environment.
    pub fn from_env() -> SchedulerResult<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> SchedulerResult<Self> {
        let mut config = Self::default();
        if let Some(raw) = lookup(BACKOFF_PERIOD_ENV) {
            config.backoff_period = parse_duration(&raw).ok_or_else(|| {
                SchedulerError::Config(format!("{BACKOFF_PERIOD_ENV}: invalid duration {raw:?}"))
            })?;
        }
        Ok(config)
    }

    pub fn with_backoff_period(mut self, period: Duration) -> Self {
        self.backoff_period = period;
        self
    }

    pub fn with_max_host_checks(mut self, checks: u32) -> Self {
        self.max_host_checks = checks;
        self
    }

    pub fn with_host_check_interval(mut self, interval: Duration) -> Self {
        self.host_check_interval = interval;
        self
    }

    pub fn with_placement_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.placement_attempts = attempts;
        self.placement_retry_delay = delay;
        self
    }

    /// Set the three periodic sync intervals (jobs, formations, hosts).
    pub fn with_sync_intervals(mut self, jobs: Duration, formations: Duration, hosts: Duration) -> Self {
        self.sync_jobs_interval = jobs;
        self.sync_formations_interval = formations;
        self.sync_hosts_interval = hosts;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_persist_retry(mut self, delay: Duration, total: Duration) -> Self {
        self.persist_retry_delay = delay;
        self.persist_retry_total = total;
        self
    }

    /// Reject values the pump cannot run with.
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.channel_capacity == 0 || self.subscriber_capacity == 0 {
            return Err(SchedulerError::Config("channel capacities must be non-zero".to_string()));
        }
        if self.placement_attempts == 0 {
            return Err(SchedulerError::Config("placement_attempts must be at least 1".to_string()));
        }
        let intervals = [
            ("sync_jobs_interval", self.sync_jobs_interval),
            ("sync_formations_interval", self.sync_formations_interval),
            ("sync_hosts_interval", self.sync_hosts_interval),
            ("host_check_interval", self.host_check_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(SchedulerError::Config(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

/// Parse a duration string such as "10m", "500ms", "1h30m" or "1.5s".
///
/// Units: ns, us (or µs), ms, s, m, h. A bare "0" is zero.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s == "0" {
        return Some(Duration::ZERO);
    }
    if s.is_empty() {
        return None;
    }

    let mut nanos = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_end == 0 {
            return None;
        }
        let value: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        nanos += value * scale;
        rest = &rest[unit_end..];
    }
    Some(Duration::from_nanos(nanos.round() as u64))
}
