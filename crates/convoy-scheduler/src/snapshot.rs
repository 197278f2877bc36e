//! Point-in-time view of scheduler state, served to handles.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use convoy_cluster::HostTable;
use convoy_state::{FormationKey, FormationTable, HostId, JobState, JobTable, StopReason, Tags};

#[derive(Debug, Clone, Serialize)]
pub struct HostSummary {
    pub id: HostId,
    pub tags: Tags,
    pub healthy: bool,
    pub shutdown: bool,
    pub failed_checks: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormationSummary {
    pub key: FormationKey,
    pub processes: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub job_id: Option<String>,
    pub host_id: Option<HostId>,
    pub job_type: String,
    pub formation: Option<FormationKey>,
    pub state: JobState,
    pub restarts: u32,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub is_leader: Option<bool>,
    pub hosts: Vec<HostSummary>,
    pub formations: Vec<FormationSummary>,
    /// Jobs ordered by formation, type, then id.
    pub jobs: Vec<JobSummary>,
}

impl Snapshot {
    pub(crate) fn capture(
        is_leader: Option<bool>,
        hosts: &HostTable,
        formations: &FormationTable,
        jobs: &JobTable,
    ) -> Self {
        let hosts = hosts
            .iter()
            .map(|host| HostSummary {
                id: host.id().to_string(),
                tags: host.tags.clone(),
                healthy: host.is_healthy(),
                shutdown: host.shutdown,
                failed_checks: host.health.consecutive_failures(),
            })
            .collect();
        let formations = formations
            .iter()
            .map(|f| FormationSummary {
                key: f.key.clone(),
                processes: f.processes.clone(),
            })
            .collect();
        let mut jobs: Vec<JobSummary> = jobs
            .iter()
            .map(|job| JobSummary {
                id: job.id,
                job_id: job.job_id.clone(),
                host_id: job.host_id.clone(),
                job_type: job.job_type.clone(),
                formation: job.formation.clone(),
                state: job.state,
                restarts: job.restarts,
                stop_reason: job.stop_reason,
            })
            .collect();
        jobs.sort_by(|a, b| {
            (&a.formation, &a.job_type, a.id).cmp(&(&b.formation, &b.job_type, b.id))
        });
        Self {
            is_leader,
            hosts,
            formations,
            jobs,
        }
    }

    /// Jobs of a (formation, type) that count towards its desired count.
    pub fn active_jobs(&self, key: &FormationKey, job_type: &str) -> Vec<&JobSummary> {
        self.jobs
            .iter()
            .filter(|j| j.formation.as_ref() == Some(key) && j.job_type == job_type && j.state.is_active())
            .collect()
    }

    pub fn jobs_in_state(&self, state: JobState) -> Vec<&JobSummary> {
        self.jobs.iter().filter(|j| j.state == state).collect()
    }

    pub fn host(&self, id: &str) -> Option<&HostSummary> {
        self.hosts.iter().find(|h| h.id == id)
    }
}
