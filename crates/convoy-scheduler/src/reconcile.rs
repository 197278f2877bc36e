//! Reconciliation: diff a formation against the jobs bound to it.
//!
//! Planning is pure: it reads the formation, job and host tables and
//! returns the jobs to start and stop. The pump applies the plan.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use convoy_cluster::HostTable;
use convoy_placement::{matching_host_count, tags_match};
use convoy_state::{Formation, Job, JobState, JobTable};

/// Work needed to bring a formation to its desired counts.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Plan {
    /// One entry per job to start, naming its type.
    pub starts: Vec<String>,
    /// Jobs to stop, in the order they were chosen.
    pub stops: Vec<Uuid>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.starts.is_empty() && self.stops.is_empty()
    }
}

/// Desired job count for a type, with omni types multiplied by the number
/// of available hosts matching their tags.
pub fn desired_count(formation: &Formation, job_type: &str, hosts: &HostTable) -> u32 {
    if !formation.is_schedulable(job_type) {
        return 0;
    }
    let count = formation.desired(job_type);
    if formation.is_omni(job_type) {
        count * matching_host_count(hosts, &formation.required_tags(job_type))
    } else {
        count
    }
}

/// Plan every type named by the formation or present in the job table.
pub fn plan(formation: &Formation, jobs: &JobTable, hosts: &HostTable) -> Plan {
    let mut types: BTreeSet<String> = formation.processes.keys().cloned().collect();
    types.extend(jobs.types_for(&formation.key));

    let mut plan = Plan::default();
    for job_type in &types {
        plan_type(formation, job_type, jobs, hosts, &mut plan);
    }
    plan
}

fn plan_type(formation: &Formation, job_type: &str, jobs: &JobTable, hosts: &HostTable, plan: &mut Plan) {
    let required = formation.required_tags(job_type);
    let mut active: Vec<&Job> = jobs
        .for_type(&formation.key, job_type)
        .filter(|j| j.is_active())
        .collect();

    // Jobs on hosts whose tags no longer satisfy the type.
    active.retain(|job| {
        let drifted = job
            .host_id
            .as_deref()
            .and_then(|id| hosts.get(id))
            .is_some_and(|host| !tags_match(&required, &host.tags));
        if drifted {
            plan.stops.push(job.id);
        }
        !drifted
    });

    if formation.is_omni(job_type) {
        let per_host = formation.desired(job_type) as usize;
        let mut by_host: BTreeMap<&str, Vec<&Job>> = BTreeMap::new();
        for job in active.iter().copied() {
            if let Some(host_id) = job.host_id.as_deref() {
                by_host.entry(host_id).or_default().push(job);
            }
        }
        let mut surplus = BTreeSet::new();
        for on_host in by_host.values_mut() {
            if on_host.len() > per_host {
                on_host.sort_by(|a, b| stop_order(a, b, hosts));
                let extra = on_host.len() - per_host;
                surplus.extend(on_host.iter().take(extra).map(|j| j.id));
            }
        }
        if !surplus.is_empty() {
            active.retain(|j| !surplus.contains(&j.id));
            plan.stops.extend(surplus);
        }
    }

    let desired = desired_count(formation, job_type, hosts) as usize;
    let actual = active.len();
    if desired > actual {
        plan.starts
            .extend(std::iter::repeat_n(job_type.to_string(), desired - actual));
    } else if actual > desired {
        active.sort_by(|a, b| stop_order(a, b, hosts));
        plan.stops
            .extend(active.iter().take(actual - desired).map(|j| j.id));
    }
}

/// Jobs that are cheapest to lose come first: not yet on a host, then
/// waiting on a restart, then on an unhealthy or shutting-down host, then
/// starting before running. Within a rank the most recently started goes
/// first.
fn stop_order(a: &Job, b: &Job, hosts: &HostTable) -> Ordering {
    stop_rank(a, hosts)
        .cmp(&stop_rank(b, hosts))
        .then_with(|| match (a.started_at, b.started_at) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => y.cmp(&x),
        })
        .then_with(|| a.id.cmp(&b.id))
}

fn stop_rank(job: &Job, hosts: &HostTable) -> u8 {
    let on_unavailable_host = job
        .host_id
        .as_deref()
        .and_then(|id| hosts.get(id))
        .is_some_and(|h| !h.is_available());
    match job.state {
        JobState::New => 0,
        JobState::Pending => 1,
        JobState::Scheduled => 2,
        _ if on_unavailable_host => 3,
        JobState::Starting => 4,
        _ => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::{Duration, Instant};

    use chrono::Utc;
    use tokio::sync::mpsc;

    use convoy_sim::FakeHost;
    use convoy_state::{App, ExpandedFormation, ProcessType, Release, Tags};

    fn test_formation(count: u32, process: ProcessType) -> Formation {
        Formation::from_expanded(ExpandedFormation {
            app: App {
                id: "app-1".to_string(),
                name: "blog".to_string(),
                meta: BTreeMap::new(),
            },
            release: Release {
                id: "rel-1".to_string(),
                processes: BTreeMap::from([("web".to_string(), process)]),
                ..Release::default()
            },
            processes: BTreeMap::from([("web".to_string(), count)]),
            tags: BTreeMap::new(),
            updated_at: Utc::now(),
        })
    }

    fn test_hosts(hosts: &[(&str, Tags)]) -> (HostTable, mpsc::Receiver<convoy_cluster::HostUpdate>) {
        let (tx, rx) = mpsc::channel(64);
        let mut table = HostTable::new(tx).with_retry_delay(Duration::from_secs(60));
        for (id, tags) in hosts {
            table.follow(FakeHost::with_tags(id, tags.clone()));
        }
        (table, rx)
    }

    fn job_on(formation: &Formation, host: &str, state: JobState, started_at: Option<Instant>) -> Job {
        let mut job = Job::new(formation, "web", 0);
        job.host_id = Some(host.to_string());
        job.job_id = Some(format!("{host}-{}", job.id));
        job.state = state;
        job.started_at = started_at;
        job
    }

    fn ssd() -> Tags {
        Tags::from([("disk".to_string(), "ssd".to_string())])
    }

    #[tokio::test]
    async fn scale_up_requests_missing_jobs() {
        let formation = test_formation(3, ProcessType::default());
        let (hosts, _rx) = test_hosts(&[("host1", Tags::new())]);
        let mut jobs = JobTable::new();
        jobs.insert(job_on(&formation, "host1", JobState::Running, Some(Instant::now())));

        let plan = plan(&formation, &jobs, &hosts);
        assert_eq!(plan.starts, vec!["web".to_string(), "web".to_string()]);
        assert!(plan.stops.is_empty());
    }

    #[tokio::test]
    async fn scale_down_prefers_unplaced_then_newest() {
        let formation = test_formation(1, ProcessType::default());
        let (hosts, _rx) = test_hosts(&[("host1", Tags::new())]);
        let now = Instant::now();
        let mut jobs = JobTable::new();

        let oldest = job_on(&formation, "host1", JobState::Running, Some(now));
        let newer = job_on(&formation, "host1", JobState::Running, Some(now + Duration::from_secs(5)));
        let starting = job_on(&formation, "host1", JobState::Starting, Some(now + Duration::from_secs(1)));
        let unplaced = Job::new(&formation, "web", 0);
        let (oldest_id, newer_id, starting_id, unplaced_id) = (oldest.id, newer.id, starting.id, unplaced.id);
        for job in [oldest, newer, starting, unplaced] {
            jobs.insert(job);
        }

        let plan = plan(&formation, &jobs, &hosts);
        assert!(plan.starts.is_empty());
        assert_eq!(plan.stops, vec![unplaced_id, starting_id, newer_id]);
        assert!(!plan.stops.contains(&oldest_id));
    }

    #[tokio::test]
    async fn jobs_on_shutdown_hosts_stop_before_running_ones() {
        let formation = test_formation(1, ProcessType::default());
        let (mut hosts, _rx) = test_hosts(&[("host1", Tags::new()), ("host2", Tags::new())]);
        hosts.mark_shutdown("host2");
        let now = Instant::now();
        let mut jobs = JobTable::new();
        let keep = job_on(&formation, "host1", JobState::Running, Some(now + Duration::from_secs(9)));
        let leaving = job_on(&formation, "host2", JobState::Running, Some(now));
        let leaving_id = leaving.id;
        jobs.insert(keep);
        jobs.insert(leaving);

        assert_eq!(plan(&formation, &jobs, &hosts).stops, vec![leaving_id]);
    }

    #[tokio::test]
    async fn omni_shrink_stops_job_on_unhealthy_host() {
        let process = ProcessType {
            omni: true,
            ..ProcessType::default()
        };
        let formation = test_formation(1, process);
        let (mut hosts, _rx) = test_hosts(&[("host1", Tags::new()), ("host2", Tags::new())]);
        let now = Instant::now();
        let mut jobs = JobTable::new();
        let healthy = job_on(&formation, "host1", JobState::Running, Some(now + Duration::from_secs(9)));
        let sick = job_on(&formation, "host2", JobState::Running, Some(now));
        let (healthy_id, sick_id) = (healthy.id, sick.id);
        jobs.insert(healthy);
        jobs.insert(sick);
        assert!(plan(&formation, &jobs, &hosts).is_empty());

        hosts.mark_unhealthy("host2");
        assert_eq!(desired_count(&formation, "web", &hosts), 1);
        let plan = plan(&formation, &jobs, &hosts);
        assert_eq!(plan.stops, vec![sick_id]);
        assert!(!plan.stops.contains(&healthy_id));
        assert!(plan.starts.is_empty());
    }

    #[tokio::test]
    async fn stopping_jobs_do_not_count() {
        let formation = test_formation(1, ProcessType::default());
        let (hosts, _rx) = test_hosts(&[("host1", Tags::new())]);
        let mut jobs = JobTable::new();
        jobs.insert(job_on(&formation, "host1", JobState::Stopping, None));
        jobs.insert(job_on(&formation, "host1", JobState::Stopped, None));

        assert_eq!(plan(&formation, &jobs, &hosts).starts, vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn omni_desired_scales_with_matching_hosts() {
        let process = ProcessType {
            omni: true,
            tags: ssd(),
            ..ProcessType::default()
        };
        let formation = test_formation(2, process);
        let (hosts, _rx) = test_hosts(&[("host1", ssd()), ("host2", ssd()), ("host3", Tags::new())]);

        assert_eq!(desired_count(&formation, "web", &hosts), 4);
        let plan = plan(&formation, &JobTable::new(), &hosts);
        assert_eq!(plan.starts.len(), 4);
    }

    #[tokio::test]
    async fn omni_surplus_on_one_host_is_stopped() {
        let process = ProcessType {
            omni: true,
            ..ProcessType::default()
        };
        let formation = test_formation(1, process);
        let (hosts, _rx) = test_hosts(&[("host1", Tags::new()), ("host2", Tags::new())]);
        let now = Instant::now();
        let mut jobs = JobTable::new();
        let first = job_on(&formation, "host1", JobState::Running, Some(now));
        let second = job_on(&formation, "host1", JobState::Running, Some(now + Duration::from_secs(1)));
        let second_id = second.id;
        jobs.insert(first);
        jobs.insert(second);

        let plan = plan(&formation, &jobs, &hosts);
        assert_eq!(plan.stops, vec![second_id]);
        assert_eq!(plan.starts, vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn tag_drift_replaces_job() {
        let process = ProcessType {
            tags: ssd(),
            ..ProcessType::default()
        };
        let formation = test_formation(1, process);
        let (mut hosts, _rx) = test_hosts(&[("host1", ssd()), ("host2", ssd())]);
        let mut jobs = JobTable::new();
        let job = job_on(&formation, "host1", JobState::Running, Some(Instant::now()));
        let id = job.id;
        jobs.insert(job);
        assert!(plan(&formation, &jobs, &hosts).is_empty());

        hosts.update_tags("host1", Tags::new());
        let plan = plan(&formation, &jobs, &hosts);
        assert_eq!(plan.stops, vec![id]);
        assert_eq!(plan.starts, vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn types_missing_from_release_are_stopped() {
        let formation = test_formation(1, ProcessType::default());
        let (hosts, _rx) = test_hosts(&[("host1", Tags::new())]);
        let mut jobs = JobTable::new();
        let mut orphan = job_on(&formation, "host1", JobState::Running, Some(Instant::now()));
        orphan.job_type = "worker".to_string();
        let orphan_id = orphan.id;
        jobs.insert(orphan);
        jobs.insert(job_on(&formation, "host1", JobState::Running, Some(Instant::now())));

        let plan = plan(&formation, &jobs, &hosts);
        assert_eq!(plan.stops, vec![orphan_id]);
        assert!(plan.starts.is_empty());
    }
}
