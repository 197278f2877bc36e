//! Simulated container host.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::debug;

use convoy_cluster::{ClientError, ClientResult, HostClient};
use convoy_state::{ActiveJob, HostId, HostJobStatus, HostStatus, JobConfig, Tags};

use crate::{STREAM_CAPACITY, broadcast, lock};

/// An RPC the host received.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    AddJob(JobConfig),
    StopJob(String),
    ProvisionVolume(String),
}

struct HostState {
    tags: Tags,
    /// Jobs that have not terminated, by cluster job id.
    jobs: HashMap<String, ActiveJob>,
    subscribers: Vec<mpsc::Sender<ActiveJob>>,
    calls: Vec<HostCall>,
    healthy: bool,
    /// Report `Running` right after `Starting` on `AddJob`.
    auto_start: bool,
    fail_add: Option<ClientError>,
    next_volume: u32,
}

pub struct FakeHost {
    id: HostId,
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new(id: &str) -> Arc<Self> {
        Self::with_tags(id, Tags::new())
    }

    pub fn with_tags(id: &str, tags: Tags) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            state: Mutex::new(HostState {
                tags,
                jobs: HashMap::new(),
                subscribers: Vec::new(),
                calls: Vec::new(),
                healthy: true,
                auto_start: true,
                fail_add: None,
                next_volume: 0,
            }),
        })
    }

    pub fn host_id(&self) -> &str {
        &self.id
    }

    pub fn set_tags(&self, tags: Tags) {
        lock(&self.state).tags = tags;
    }

    /// Leave added jobs in `Starting` until [`FakeHost::start`] is called.
    pub fn set_auto_start(&self, auto_start: bool) {
        lock(&self.state).auto_start = auto_start;
    }

    /// Make every `AddJob` fail with `error` until cleared with `None`.
    pub fn set_fail_add(&self, error: Option<ClientError>) {
        lock(&self.state).fail_add = error;
    }

    /// An unhealthy host drops its event streams and refuses every RPC.
    pub fn set_healthy(&self, healthy: bool) {
        let mut state = lock(&self.state);
        state.healthy = healthy;
        if !healthy {
            state.subscribers.clear();
        }
    }

    /// Move a starting job to `Running`.
    pub fn start(&self, job_id: &str) -> bool {
        self.transition(job_id, HostJobStatus::Running, None)
    }

    /// Crash a job with a non-zero exit status.
    pub fn crash(&self, job_id: &str) -> bool {
        self.transition(job_id, HostJobStatus::Crashed, Some(1))
    }

    /// Exit a job cleanly.
    pub fn exit(&self, job_id: &str) -> bool {
        self.transition(job_id, HostJobStatus::Done, Some(0))
    }

    /// Put an arbitrary job record on the host and report it.
    pub fn inject(&self, job: ActiveJob) {
        let mut state = lock(&self.state);
        if job.status.is_terminal() {
            state.jobs.remove(&job.job_id);
        } else {
            state.jobs.insert(job.job_id.clone(), job.clone());
        }
        broadcast(&mut state.subscribers, job);
    }

    /// Drop a job without reporting it, as if the host forgot it.
    pub fn forget(&self, job_id: &str) -> bool {
        lock(&self.state).jobs.remove(job_id).is_some()
    }

    pub fn jobs(&self) -> Vec<ActiveJob> {
        let mut jobs: Vec<ActiveJob> = lock(&self.state).jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        jobs
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs().into_iter().map(|job| job.job_id).collect()
    }

    pub fn job_count(&self) -> usize {
        lock(&self.state).jobs.len()
    }

    pub fn calls(&self) -> Vec<HostCall> {
        lock(&self.state).calls.clone()
    }

    pub fn added(&self) -> Vec<JobConfig> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                HostCall::AddJob(config) => Some(config),
                _ => None,
            })
            .collect()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                HostCall::StopJob(job_id) => Some(job_id),
                _ => None,
            })
            .collect()
    }

    fn transition(&self, job_id: &str, status: HostJobStatus, exit_status: Option<i32>) -> bool {
        let mut state = lock(&self.state);
        let Some(mut job) = state.jobs.remove(job_id) else {
            return false;
        };
        job.status = status;
        job.exit_status = exit_status;
        if !status.is_terminal() {
            state.jobs.insert(job_id.to_string(), job.clone());
        }
        debug!(host_id = %self.id, %job_id, ?status, "simulated job transition");
        broadcast(&mut state.subscribers, job);
        true
    }

    fn check_healthy(&self, state: &HostState) -> ClientResult<()> {
        if state.healthy {
            Ok(())
        } else {
            Err(ClientError::Unavailable(format!("host {} is down", self.id)))
        }
    }
}

#[async_trait]
impl HostClient for FakeHost {
    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> Tags {
        lock(&self.state).tags.clone()
    }

    async fn list_jobs(&self) -> ClientResult<HashMap<String, ActiveJob>> {
        let state = lock(&self.state);
        self.check_healthy(&state)?;
        Ok(state.jobs.clone())
    }

    async fn add_job(&self, config: &JobConfig) -> ClientResult<()> {
        let mut state = lock(&self.state);
        self.check_healthy(&state)?;
        state.calls.push(HostCall::AddJob(config.clone()));
        if let Some(error) = state.fail_add.clone() {
            return Err(error);
        }
        if state.jobs.contains_key(&config.job_id) {
            return Err(ClientError::Rejected(format!("job {} exists", config.job_id)));
        }

        let mut job = ActiveJob {
            job_id: config.job_id.clone(),
            status: HostJobStatus::Starting,
            started_at: Some(Utc::now()),
            exit_status: None,
            host_error: None,
            metadata: config.metadata.clone(),
        };
        broadcast(&mut state.subscribers, job.clone());
        if state.auto_start {
            job.status = HostJobStatus::Running;
            broadcast(&mut state.subscribers, job.clone());
        }
        state.jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    async fn stop_job(&self, job_id: &str) -> ClientResult<()> {
        {
            let mut state = lock(&self.state);
            self.check_healthy(&state)?;
            state.calls.push(HostCall::StopJob(job_id.to_string()));
        }
        if self.transition(job_id, HostJobStatus::Done, Some(0)) {
            Ok(())
        } else {
            Err(ClientError::NotFound(job_id.to_string()))
        }
    }

    async fn stream_events(&self) -> ClientResult<mpsc::Receiver<ActiveJob>> {
        let mut state = lock(&self.state);
        self.check_healthy(&state)?;
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        state.subscribers.push(tx);
        Ok(rx)
    }

    async fn get_status(&self) -> ClientResult<HostStatus> {
        let state = lock(&self.state);
        self.check_healthy(&state)?;
        Ok(HostStatus {
            host_id: self.id.clone(),
            tags: state.tags.clone(),
        })
    }

    async fn provision_volume(&self, config: &JobConfig) -> ClientResult<String> {
        let mut state = lock(&self.state);
        self.check_healthy(&state)?;
        state.calls.push(HostCall::ProvisionVolume(config.job_id.clone()));
        state.next_volume += 1;
        Ok(format!("{}-vol-{}", self.id, state.next_volume))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config(job_id: &str) -> JobConfig {
        JobConfig {
            job_id: job_id.to_string(),
            artifacts: Vec::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            resources: Default::default(),
            metadata: BTreeMap::from([("k".to_string(), "v".to_string())]),
            volumes: Vec::new(),
            service: None,
        }
    }

    #[tokio::test]
    async fn add_job_reports_starting_then_running() {
        let host = FakeHost::new("host1");
        let mut events = host.stream_events().await.unwrap();
        host.add_job(&config("host1-a")).await.unwrap();

        assert_eq!(events.recv().await.unwrap().status, HostJobStatus::Starting);
        let running = events.recv().await.unwrap();
        assert_eq!(running.status, HostJobStatus::Running);
        assert_eq!(running.metadata.get("k").unwrap(), "v");
        assert_eq!(host.job_ids(), vec!["host1-a".to_string()]);
    }

    #[tokio::test]
    async fn crash_removes_job_and_reports_it() {
        let host = FakeHost::new("host1");
        host.add_job(&config("host1-a")).await.unwrap();
        let mut events = host.stream_events().await.unwrap();

        assert!(host.crash("host1-a"));
        let crashed = events.recv().await.unwrap();
        assert_eq!(crashed.status, HostJobStatus::Crashed);
        assert_eq!(crashed.exit_status, Some(1));
        assert_eq!(host.job_count(), 0);
        assert!(!host.crash("host1-a"));
    }

    #[tokio::test]
    async fn unhealthy_host_refuses_calls_and_drops_streams() {
        let host = FakeHost::new("host1");
        let mut events = host.stream_events().await.unwrap();
        host.set_healthy(false);

        assert!(events.recv().await.is_none());
        assert!(host.get_status().await.is_err());
        assert!(host.add_job(&config("host1-a")).await.is_err());

        host.set_healthy(true);
        assert!(host.get_status().await.is_ok());
    }

    #[tokio::test]
    async fn stop_job_records_call() {
        let host = FakeHost::new("host1");
        host.add_job(&config("host1-a")).await.unwrap();
        host.stop_job("host1-a").await.unwrap();
        assert_eq!(host.stopped(), vec!["host1-a".to_string()]);
        assert!(matches!(
            host.stop_job("host1-a").await,
            Err(ClientError::NotFound(_))
        ));
    }
}
