//! Candidate lists built from the scheduler's host and job tables.

use convoy_cluster::HostTable;
use convoy_state::{FormationKey, HostId, JobTable, Tags};

use crate::scorer::{HostCandidate, tags_match};

/// One candidate per followed host, with its load for (formation, type).
pub fn candidates(
    hosts: &HostTable,
    jobs: &JobTable,
    formation: &FormationKey,
    job_type: &str,
) -> Vec<HostCandidate> {
    hosts
        .iter()
        .map(|host| HostCandidate {
            host_id: host.id().to_string(),
            tags: host.tags.clone(),
            available: host.is_available(),
            load: jobs.host_load(formation, job_type, host.id()),
        })
        .collect()
}

/// Available hosts satisfying a tag predicate, in id order.
pub fn matching_host_ids(hosts: &HostTable, required: &Tags) -> Vec<HostId> {
    hosts
        .iter()
        .filter(|h| h.is_available() && tags_match(required, &h.tags))
        .map(|h| h.id().to_string())
        .collect()
}

/// Number of available hosts satisfying a tag predicate; the omni multiplier.
pub fn matching_host_count(hosts: &HostTable, required: &Tags) -> u32 {
    matching_host_ids(hosts, required).len() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use convoy_cluster::{ClientError, ClientResult, HostClient};
    use convoy_state::{
        ActiveJob, App, ExpandedFormation, Formation, HostStatus, Job, JobConfig, JobState,
        ProcessType, Release,
    };
    use tokio::sync::mpsc;

    struct TaggedHost {
        id: String,
        tags: Tags,
    }

    #[async_trait]
    impl HostClient for TaggedHost {
        fn id(&self) -> &str {
            &self.id
        }

        fn tags(&self) -> Tags {
            self.tags.clone()
        }

        async fn list_jobs(&self) -> ClientResult<HashMap<String, ActiveJob>> {
            Err(ClientError::Unavailable("test".to_string()))
        }

        async fn add_job(&self, _config: &JobConfig) -> ClientResult<()> {
            Ok(())
        }

        async fn stop_job(&self, _job_id: &str) -> ClientResult<()> {
            Ok(())
        }

        async fn stream_events(&self) -> ClientResult<mpsc::Receiver<ActiveJob>> {
            Err(ClientError::Unavailable("test".to_string()))
        }

        async fn get_status(&self) -> ClientResult<HostStatus> {
            Err(ClientError::Unavailable("test".to_string()))
        }

        async fn provision_volume(&self, _config: &JobConfig) -> ClientResult<String> {
            Ok("vol".to_string())
        }
    }

    fn host(id: &str, tags: &[(&str, &str)]) -> Arc<dyn HostClient> {
        Arc::new(TaggedHost {
            id: id.to_string(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }

    fn test_formation() -> Formation {
        Formation::from_expanded(ExpandedFormation {
            app: App {
                id: "app-1".to_string(),
                name: "blog".to_string(),
                meta: BTreeMap::new(),
            },
            release: Release {
                id: "rel-1".to_string(),
                processes: BTreeMap::from([("web".to_string(), ProcessType::default())]),
                ..Release::default()
            },
            processes: BTreeMap::from([("web".to_string(), 3)]),
            tags: BTreeMap::new(),
            updated_at: Utc::now(),
        })
    }

    fn test_hosts() -> (HostTable, mpsc::Receiver<convoy_cluster::HostUpdate>) {
        let (tx, rx) = mpsc::channel(64);
        let mut hosts = HostTable::new(tx).with_retry_delay(Duration::from_secs(60));
        hosts.follow(host("host1", &[("disk", "ssd")]));
        hosts.follow(host("host2", &[("disk", "hdd")]));
        hosts.follow(host("host3", &[("disk", "ssd")]));
        (hosts, rx)
    }

    #[tokio::test]
    async fn candidates_carry_per_host_load() {
        let (hosts, _rx) = test_hosts();
        let formation = test_formation();
        let mut jobs = JobTable::new();
        for host_id in ["host1", "host1", "host3"] {
            let mut job = Job::new(&formation, "web", 0);
            job.host_id = Some(host_id.to_string());
            job.state = JobState::Running;
            jobs.insert(job);
        }

        let list = candidates(&hosts, &jobs, &formation.key, "web");
        let loads: Vec<(String, u32)> = list.iter().map(|c| (c.host_id.clone(), c.load)).collect();
        assert_eq!(
            loads,
            vec![
                ("host1".to_string(), 2),
                ("host2".to_string(), 0),
                ("host3".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn matching_hosts_respect_tags_and_health() {
        let (mut hosts, _rx) = test_hosts();
        let ssd: Tags = [("disk".to_string(), "ssd".to_string())].into();
        assert_eq!(matching_host_count(&hosts, &ssd), 2);
        assert_eq!(matching_host_count(&hosts, &Tags::new()), 3);

        hosts.mark_unhealthy("host3");
        assert_eq!(matching_host_ids(&hosts, &ssd), vec!["host1".to_string()]);
    }
}
