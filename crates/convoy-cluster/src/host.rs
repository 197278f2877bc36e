//! Host follower: one long-lived job-event stream per host.
//!
//! Each followed host gets a background task that lists the host's jobs,
//! opens its event stream and feeds both into the scheduler in order.
//! When the stream drops, the task reports the loss and reconnects after
//! a fixed delay, repeating list + stream so no state change is missed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use convoy_state::{ActiveJob, HostId, HostJobEvent, JobEventSource, Tags};

use crate::client::HostClient;
use crate::health::HostHealth;

/// Item produced by a host follower.
#[derive(Debug, Clone, PartialEq)]
pub enum HostUpdate {
    Job(HostJobEvent),
    /// The event stream dropped; a reconnect is pending.
    StreamLost { host_id: HostId },
}

/// Background follower task for one host.
struct Follower {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// A container host as seen by the scheduler.
pub struct Host {
    id: HostId,
    pub tags: Tags,
    pub health: HostHealth,
    /// Set when discovery says the host is going away.
    pub shutdown: bool,
    client: Arc<dyn HostClient>,
    follower: Option<Follower>,
}

impl Host {
    pub fn new(client: Arc<dyn HostClient>, max_checks: u32) -> Self {
        Self {
            id: client.id().to_string(),
            tags: client.tags(),
            health: HostHealth::new(max_checks),
            shutdown: false,
            client,
            follower: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client(&self) -> Arc<dyn HostClient> {
        self.client.clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    /// Healthy and not shutting down.
    pub fn is_available(&self) -> bool {
        self.health.is_healthy() && !self.shutdown
    }

    pub fn is_following(&self) -> bool {
        self.follower.is_some()
    }

    /// Start the follower task, feeding `updates`.
    pub fn follow(&mut self, updates: mpsc::Sender<HostUpdate>, retry_delay: Duration) {
        if self.follower.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let client = self.client.clone();
        let handle = tokio::spawn(async move {
            run_follower(client, updates, retry_delay, shutdown_rx).await;
        });
        self.follower = Some(Follower {
            handle,
            shutdown_tx,
        });
        info!(host_id = %self.id, "following host");
    }

    /// Stop the follower task.
    pub fn close(&mut self) {
        if let Some(follower) = self.follower.take() {
            let _ = follower.shutdown_tx.send(true);
            follower.handle.abort();
            debug!(host_id = %self.id, "host follower stopped");
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("tags", &self.tags)
            .field("health", &self.health)
            .field("shutdown", &self.shutdown)
            .field("following", &self.follower.is_some())
            .finish()
    }
}

/// The list + stream loop for a single host.
async fn run_follower(
    client: Arc<dyn HostClient>,
    updates: mpsc::Sender<HostUpdate>,
    retry_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let host_id = client.id().to_string();

    loop {
        match connect(client.as_ref()).await {
            Ok((snapshot, mut stream)) => {
                debug!(%host_id, jobs = snapshot.len(), "host stream connected");
                for job in snapshot {
                    if !forward(&updates, &host_id, job, JobEventSource::Snapshot).await {
                        return;
                    }
                }
                loop {
                    tokio::select! {
                        item = stream.recv() => match item {
                            Some(job) => {
                                if !forward(&updates, &host_id, job, JobEventSource::Stream).await {
                                    return;
                                }
                            }
                            None => break,
                        },
                        _ = shutdown.changed() => return,
                    }
                }
                warn!(%host_id, "host event stream disconnected");
            }
            Err(e) => {
                debug!(%host_id, error = %e, "host stream connect failed");
            }
        }

        let lost = HostUpdate::StreamLost {
            host_id: host_id.clone(),
        };
        if updates.send(lost).await.is_err() {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(retry_delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// List the host's jobs, then open its event stream.
async fn connect(
    client: &dyn HostClient,
) -> crate::ClientResult<(Vec<ActiveJob>, mpsc::Receiver<ActiveJob>)> {
    let jobs = client.list_jobs().await?;
    let stream = client.stream_events().await?;
    Ok((jobs.into_values().collect(), stream))
}

async fn forward(
    updates: &mpsc::Sender<HostUpdate>,
    host_id: &str,
    job: ActiveJob,
    source: JobEventSource,
) -> bool {
    let event = HostJobEvent {
        host_id: host_id.to_string(),
        job,
        source,
    };
    updates.send(HostUpdate::Job(event)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use convoy_state::{HostJobStatus, HostStatus, JobConfig};

    use crate::error::{ClientError, ClientResult};

    struct StubHost {
        jobs: HashMap<String, ActiveJob>,
        streams: Mutex<Vec<mpsc::Receiver<ActiveJob>>>,
    }

    #[async_trait]
    impl HostClient for StubHost {
        fn id(&self) -> &str {
            "host1"
        }

        fn tags(&self) -> Tags {
            Tags::from([("disk".to_string(), "ssd".to_string())])
        }

        async fn list_jobs(&self) -> ClientResult<HashMap<String, ActiveJob>> {
            Ok(self.jobs.clone())
        }

        async fn add_job(&self, _config: &JobConfig) -> ClientResult<()> {
            Ok(())
        }

        async fn stop_job(&self, _job_id: &str) -> ClientResult<()> {
            Ok(())
        }

        async fn stream_events(&self) -> ClientResult<mpsc::Receiver<ActiveJob>> {
            self.streams
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| ClientError::Unavailable("no stream".to_string()))
        }

        async fn get_status(&self) -> ClientResult<HostStatus> {
            Ok(HostStatus {
                host_id: "host1".to_string(),
                tags: Tags::new(),
            })
        }

        async fn provision_volume(&self, _config: &JobConfig) -> ClientResult<String> {
            Ok("vol-1".to_string())
        }
    }

    fn active(job_id: &str, status: HostJobStatus) -> ActiveJob {
        ActiveJob {
            job_id: job_id.to_string(),
            status,
            started_at: None,
            exit_status: None,
            host_error: None,
            metadata: Default::default(),
        }
    }

    #[test]
    fn new_host_copies_identity_and_tags() {
        let stub = StubHost {
            jobs: HashMap::new(),
            streams: Mutex::new(Vec::new()),
        };
        let host = Host::new(Arc::new(stub), 10);
        assert_eq!(host.id(), "host1");
        assert_eq!(host.tags.get("disk").unwrap(), "ssd");
        assert!(host.is_available());
        assert!(!host.is_following());
    }

    #[tokio::test]
    async fn follower_feeds_snapshot_then_stream_then_reconnects() {
        let (stream_tx, stream_rx) = mpsc::channel(8);
        let stub = StubHost {
            jobs: HashMap::from([("host1-a".to_string(), active("host1-a", HostJobStatus::Running))]),
            streams: Mutex::new(vec![stream_rx]),
        };
        let (updates_tx, mut updates_rx) = mpsc::channel(8);
        let mut host = Host::new(Arc::new(stub), 10);
        host.follow(updates_tx, Duration::from_millis(10));
        assert!(host.is_following());

        match updates_rx.recv().await.unwrap() {
            HostUpdate::Job(event) => {
                assert_eq!(event.host_id, "host1");
                assert_eq!(event.job.job_id, "host1-a");
                assert_eq!(event.source, JobEventSource::Snapshot);
            }
            other => panic!("unexpected update: {other:?}"),
        }

        stream_tx
            .send(active("host1-b", HostJobStatus::Starting))
            .await
            .unwrap();
        match updates_rx.recv().await.unwrap() {
            HostUpdate::Job(event) => {
                assert_eq!(event.job.job_id, "host1-b");
                assert_eq!(event.source, JobEventSource::Stream);
            }
            other => panic!("unexpected update: {other:?}"),
        }

        drop(stream_tx);
        assert_eq!(
            updates_rx.recv().await.unwrap(),
            HostUpdate::StreamLost {
                host_id: "host1".to_string()
            }
        );

        // Reconnect lists again; the stream then fails to open.
        match updates_rx.recv().await.unwrap() {
            HostUpdate::Job(event) => assert_eq!(event.source, JobEventSource::Snapshot),
            other => panic!("unexpected update: {other:?}"),
        }
        assert!(matches!(
            updates_rx.recv().await.unwrap(),
            HostUpdate::StreamLost { .. }
        ));

        host.close();
        assert!(!host.is_following());
    }
}
