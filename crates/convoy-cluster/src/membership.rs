//! Host membership: the scheduler's table of followed hosts.
//!
//! Tracks every host the scheduler follows, its tags, health and shutdown
//! flag, and removes hosts that fail too many consecutive status checks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use convoy_state::{HostId, Tags};

use crate::client::HostClient;
use crate::health::{CheckResult, HealthVerdict};
use crate::host::{Host, HostUpdate};

/// Followed hosts keyed by host id.
pub struct HostTable {
    hosts: BTreeMap<HostId, Host>,
    /// Consecutive failed checks before a host is unfollowed.
    max_checks: u32,
    /// Delay between host stream reconnect attempts.
    retry_delay: Duration,
    updates: mpsc::Sender<HostUpdate>,
}

impl HostTable {
    /// Create an empty table whose followers feed `updates`.
    pub fn new(updates: mpsc::Sender<HostUpdate>) -> Self {
        Self {
            hosts: BTreeMap::new(),
            max_checks: 10,
            retry_delay: Duration::from_millis(100),
            updates,
        }
    }

    /// Set the number of failed checks before a host is removed.
    pub fn with_max_checks(mut self, max_checks: u32) -> Self {
        self.max_checks = max_checks;
        self
    }

    /// Set the host stream reconnect delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Start following a host. Returns `false` if it is already followed.
    pub fn follow(&mut self, client: Arc<dyn HostClient>) -> bool {
        let id = client.id().to_string();
        if self.hosts.contains_key(&id) {
            return false;
        }
        let mut host = Host::new(client, self.max_checks);
        host.follow(self.updates.clone(), self.retry_delay);
        info!(host_id = %id, tags = ?host.tags, "host joined");
        self.hosts.insert(id, host);
        true
    }

    /// Stop following a host and remove it.
    pub fn unfollow(&mut self, host_id: &str) -> Option<Host> {
        let mut host = self.hosts.remove(host_id)?;
        host.close();
        info!(%host_id, "host removed");
        Some(host)
    }

    /// Record a status check result. Returns the verdict, or `None` if the
    /// host is unknown. Dead hosts are left in the table for the caller to
    /// unfollow once it has handled their jobs.
    pub fn record_check(&mut self, host_id: &str, result: CheckResult) -> Option<HealthVerdict> {
        let host = self.hosts.get_mut(host_id)?;
        let verdict = host.health.record(result);
        if verdict == HealthVerdict::Dead {
            warn!(%host_id, "host declared dead");
        }
        Some(verdict)
    }

    /// Mark a host unhealthy. Returns `true` if it was healthy before.
    pub fn mark_unhealthy(&mut self, host_id: &str) -> bool {
        match self.hosts.get_mut(host_id) {
            Some(host) if host.is_healthy() => {
                host.health.mark_unhealthy();
                warn!(%host_id, "host marked unhealthy");
                true
            }
            _ => false,
        }
    }

    /// Replace a host's tags. Returns `true` if they changed.
    pub fn update_tags(&mut self, host_id: &str, tags: Tags) -> bool {
        match self.hosts.get_mut(host_id) {
            Some(host) if host.tags != tags => {
                info!(%host_id, ?tags, "host tags changed");
                host.tags = tags;
                true
            }
            _ => false,
        }
    }

    /// Flag a host as shutting down.
    pub fn mark_shutdown(&mut self, host_id: &str) -> bool {
        match self.hosts.get_mut(host_id) {
            Some(host) if !host.shutdown => {
                info!(%host_id, "host shutting down");
                host.shutdown = true;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, host_id: &str) -> Option<&Host> {
        self.hosts.get(host_id)
    }

    pub fn contains(&self, host_id: &str) -> bool {
        self.hosts.contains_key(host_id)
    }

    /// Hosts in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn ids(&self) -> Vec<HostId> {
        self.hosts.keys().cloned().collect()
    }

    /// Ids of hosts currently marked unhealthy.
    pub fn unhealthy(&self) -> Vec<HostId> {
        self.hosts
            .values()
            .filter(|h| !h.is_healthy())
            .map(|h| h.id().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Stop every follower (for shutdown).
    pub fn close_all(&mut self) {
        for host in self.hosts.values_mut() {
            host.close();
        }
        self.hosts.clear();
        info!("all host followers stopped");
    }
}
