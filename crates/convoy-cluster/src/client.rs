//! Collaborator contracts consumed by the scheduler.
//!
//! Streams are modelled as bounded `mpsc` receivers: the stream ends when
//! the sender is dropped, which the scheduler treats as a disconnect.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use convoy_state::{
    ActiveJob, App, ControllerJob, DiscoveryEvent, ExpandedFormation, FormationUpdate, HostStatus,
    JobConfig, Tags,
};

use crate::error::{ClientError, ClientResult};

/// Service discovery and leader election.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Register this scheduler instance. Returns whether it is the leader.
    async fn register(&self) -> ClientResult<bool>;

    /// Leadership transitions after registration.
    async fn leader_changes(&self) -> ClientResult<mpsc::Receiver<bool>>;

    /// Instances of a service, starting with a snapshot ended by `Current`.
    async fn watch(&self, service: &str) -> ClientResult<mpsc::Receiver<DiscoveryEvent>>;
}

/// The controller: source of formations and sink for job records.
#[async_trait]
pub trait ControllerClient: Send + Sync {
    /// Formations updated at or after `since`, then live changes.
    ///
    /// The initial snapshot ends with [`FormationUpdate::Current`].
    async fn stream_formations(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> ClientResult<mpsc::Receiver<FormationUpdate>>;

    async fn get_formation(&self, app_id: &str, release_id: &str)
    -> ClientResult<ExpandedFormation>;

    async fn app_list(&self) -> ClientResult<Vec<App>>;

    async fn formation_list(&self, app_id: &str) -> ClientResult<Vec<ExpandedFormation>>;

    /// Idempotent, last-writer-wins job record write.
    async fn put_job(&self, job: &ControllerJob) -> ClientResult<()>;
}

/// The cluster's host registry.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn hosts(&self) -> ClientResult<Vec<Arc<dyn HostClient>>>;

    async fn host(&self, id: &str) -> ClientResult<Arc<dyn HostClient>>;

    /// Host up/down/update events, starting with a snapshot ended by `Current`.
    async fn stream_host_events(&self) -> ClientResult<mpsc::Receiver<DiscoveryEvent>>;
}

/// RPC surface of a single container host.
#[async_trait]
pub trait HostClient: Send + Sync {
    fn id(&self) -> &str;

    fn tags(&self) -> Tags;

    /// Active jobs keyed by cluster job id.
    async fn list_jobs(&self) -> ClientResult<HashMap<String, ActiveJob>>;

    async fn add_job(&self, config: &JobConfig) -> ClientResult<()>;

    async fn stop_job(&self, job_id: &str) -> ClientResult<()>;

    /// Every job state change on the host, in order.
    async fn stream_events(&self) -> ClientResult<mpsc::Receiver<ActiveJob>>;

    async fn get_status(&self) -> ClientResult<HostStatus>;

    /// Provision a data volume for the job; returns the volume id.
    async fn provision_volume(&self, config: &JobConfig) -> ClientResult<String>;
}

/// Bound a collaborator call by `timeout`.
pub async fn with_timeout<T>(
    timeout: Duration,
    call: impl Future<Output = ClientResult<T>>,
) -> ClientResult<T> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(ClientError::Timeout))
}
