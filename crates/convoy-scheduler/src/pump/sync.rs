//! Job sync: compare the job table against every host's listing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use convoy_cluster::{ClientResult, HostClient, with_timeout};
use convoy_state::{ActiveJob, HostId, HostJobEvent, JobEventSource, JobState, StopReason};

use super::{Completion, Pump, now};
use crate::events::Event;
use crate::streams::fire_after;

impl Pump {
    pub(super) fn sync_jobs(&mut self) {
        let clients: Vec<(HostId, Arc<dyn HostClient>)> = self
            .hosts
            .iter()
            .map(|host| (host.id().to_string(), host.client()))
            .collect();
        let expected: HashSet<Uuid> = self
            .jobs
            .iter()
            .filter(|job| matches!(job.state, JobState::Starting | JobState::Running | JobState::Stopping))
            .map(|job| job.id)
            .collect();
        debug!(hosts = clients.len(), jobs = expected.len(), "syncing jobs");

        let timeout = self.config.rpc_timeout;
        self.complete(async move {
            let mut results = Vec::with_capacity(clients.len());
            for (host_id, client) in clients {
                results.push((host_id, with_timeout(timeout, client.list_jobs()).await));
            }
            Completion::JobsListed { expected, results }
        });
    }

    pub(super) fn jobs_listed(
        &mut self,
        expected: HashSet<Uuid>,
        results: Vec<(HostId, ClientResult<HashMap<String, ActiveJob>>)>,
    ) {
        let mut failed = Vec::new();
        for (host_id, result) in results {
            if !self.hosts.contains(&host_id) {
                continue;
            }
            match result {
                Ok(listing) => self.reconcile_host(&host_id, listing, &expected),
                Err(e) => {
                    warn!(%host_id, error = %e, "failed to list host jobs");
                    failed.push(host_id);
                }
            }
        }

        // Stops that never landed are sent again.
        for id in self.jobs.in_state(JobState::Stopping) {
            self.send_stop(id);
        }
        self.prune_stopped(self.config.sync_jobs_interval);

        let error = (!failed.is_empty()).then(|| format!("failed to list jobs on {}", failed.join(", ")));
        self.publish(Event::ClusterSync { error });
        if !failed.is_empty() {
            fire_after(
                self.outlets.triggers.sync_jobs.clone(),
                self.config.sync_retry_delay,
            );
        }
    }

    /// Apply one host's listing: report every listed job, and settle
    /// jobs the table places on the host that it no longer lists.
    fn reconcile_host(&mut self, host_id: &str, listing: HashMap<String, ActiveJob>, expected: &HashSet<Uuid>) {
        let missing: Vec<(Uuid, JobState)> = self
            .jobs
            .on_host(host_id)
            .filter(|job| expected.contains(&job.id))
            .filter(|job| matches!(job.state, JobState::Starting | JobState::Running | JobState::Stopping))
            .filter(|job| job.job_id.as_ref().is_some_and(|id| !listing.contains_key(id)))
            .map(|job| (job.id, job.state))
            .collect();

        for report in listing.into_values() {
            self.handle_job_event(HostJobEvent {
                host_id: host_id.to_string(),
                job: report,
                source: JobEventSource::Snapshot,
            });
        }

        for (id, state) in missing {
            if state == JobState::Stopping {
                self.mark_stopped(&id, StopReason::Requested);
            } else {
                warn!(job = %id, %host_id, "job missing from host listing");
                self.job_lost(id);
            }
        }
    }

    /// Forget jobs that have been stopped for longer than `retention`.
    fn prune_stopped(&mut self, retention: Duration) {
        let now = now();
        let stale: Vec<Uuid> = self
            .jobs
            .iter()
            .filter(|job| job.state == JobState::Stopped)
            .filter(|job| {
                job.stopped_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= retention)
            })
            .map(|job| job.id)
            .collect();
        if !stale.is_empty() {
            debug!(count = stale.len(), "pruning stopped jobs");
        }
        for id in stale {
            self.jobs.remove(&id);
        }
    }
}
