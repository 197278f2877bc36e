//! Job persistence: writes job records to the controller.
//!
//! Writes for the same job are applied in the order they were queued,
//! one at a time; writes for different jobs proceed concurrently. Each
//! write is bounded by the RPC timeout. A retryable failure, including a
//! timeout, is retried at a fixed interval until the retry budget runs
//! out, then the record is dropped with an error log.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use convoy_cluster::{ControllerClient, with_timeout};
use convoy_state::ControllerJob;

/// Background writer owning the controller write path.
pub struct PersistWriter {
    controller: Arc<dyn ControllerClient>,
    rpc_timeout: Duration,
    retry_delay: Duration,
    retry_total: Duration,
}

impl PersistWriter {
    pub fn new(
        controller: Arc<dyn ControllerClient>,
        rpc_timeout: Duration,
        retry_delay: Duration,
        retry_total: Duration,
    ) -> Self {
        Self {
            controller,
            rpc_timeout,
            retry_delay,
            retry_total,
        }
    }

    /// Start the writer. It exits once `rx` is closed and every queued
    /// record has been written or given up on.
    pub fn spawn(self, rx: mpsc::Receiver<ControllerJob>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }

    async fn run(self, mut rx: mpsc::Receiver<ControllerJob>) {
        // Present for every job with a write in flight; holds the writes
        // queued behind it.
        let mut queues: HashMap<Uuid, VecDeque<ControllerJob>> = HashMap::new();
        let mut inflight: JoinSet<Uuid> = JoinSet::new();
        let mut open = true;

        loop {
            tokio::select! {
                item = rx.recv(), if open => match item {
                    Some(job) => match queues.get_mut(&job.uuid) {
                        Some(queue) => queue.push_back(job),
                        None => {
                            queues.insert(job.uuid, VecDeque::new());
                            self.start(&mut inflight, job);
                        }
                    },
                    None => {
                        open = false;
                        debug!(pending = queues.len(), "persistence channel closed, draining");
                    }
                },
                Some(joined) = inflight.join_next() => match joined {
                    Ok(uuid) => {
                        let next = queues.get_mut(&uuid).and_then(VecDeque::pop_front);
                        match next {
                            Some(job) => self.start(&mut inflight, job),
                            None => {
                                queues.remove(&uuid);
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "persistence task failed"),
                },
                else => break,
            }
        }
        debug!("persistence writer stopped");
    }

    fn start(&self, inflight: &mut JoinSet<Uuid>, job: ControllerJob) {
        let controller = self.controller.clone();
        let (rpc_timeout, retry_delay, retry_total) = (self.rpc_timeout, self.retry_delay, self.retry_total);
        inflight.spawn(async move {
            let uuid = job.uuid;
            put_with_retry(controller.as_ref(), &job, rpc_timeout, retry_delay, retry_total).await;
            uuid
        });
    }
}

async fn put_with_retry(
    controller: &dyn ControllerClient,
    job: &ControllerJob,
    rpc_timeout: Duration,
    retry_delay: Duration,
    retry_total: Duration,
) {
    let deadline = Instant::now() + retry_total;
    let mut attempt = 1u32;
    loop {
        match with_timeout(rpc_timeout, controller.put_job(job)).await {
            Ok(()) => {
                debug!(job = %job.uuid, state = ?job.state, attempt, "job persisted");
                return;
            }
            Err(e) if e.is_retryable() && Instant::now() + retry_delay < deadline => {
                warn!(job = %job.uuid, error = %e, attempt, "job persist failed, retrying");
                tokio::time::sleep(retry_delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!(job = %job.uuid, state = ?job.state, error = %e, attempt, "giving up persisting job");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use convoy_sim::FakeController;
    use convoy_state::PersistedJobState;

    const RPC_TIMEOUT: Duration = Duration::from_secs(5);

    fn record(uuid: Uuid, state: PersistedJobState) -> ControllerJob {
        ControllerJob {
            uuid,
            job_id: Some(format!("host1-{uuid}")),
            host_id: Some("host1".to_string()),
            app_id: "app-1".to_string(),
            release_id: "rel-1".to_string(),
            job_type: "web".to_string(),
            state,
            restarts: 0,
            exit_status: None,
            host_error: None,
            meta: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn writes_for_one_job_keep_their_order() {
        let controller = FakeController::new();
        let writer = PersistWriter::new(controller.clone(), RPC_TIMEOUT, Duration::from_millis(1), Duration::from_secs(1));
        let (tx, rx) = mpsc::channel(16);
        let handle = writer.spawn(rx);

        let uuid = Uuid::new_v4();
        for state in [
            PersistedJobState::Starting,
            PersistedJobState::Up,
            PersistedJobState::Down,
        ] {
            tx.send(record(uuid, state)).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        let states: Vec<_> = controller.puts().iter().map(|j| j.state).collect();
        assert_eq!(
            states,
            vec![
                PersistedJobState::Starting,
                PersistedJobState::Up,
                PersistedJobState::Down
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_are_retried() {
        let controller = FakeController::new();
        controller.fail_puts(3);
        let writer = PersistWriter::new(controller.clone(), RPC_TIMEOUT, Duration::from_millis(100), Duration::from_secs(60));
        let (tx, rx) = mpsc::channel(16);
        let handle = writer.spawn(rx);

        let uuid = Uuid::new_v4();
        tx.send(record(uuid, PersistedJobState::Up)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(controller.latest(uuid).map(|j| j.state), Some(PersistedJobState::Up));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_retry_budget() {
        let controller = FakeController::new();
        controller.fail_puts(u32::MAX);
        let writer = PersistWriter::new(controller.clone(), RPC_TIMEOUT, Duration::from_millis(100), Duration::from_secs(1));
        let (tx, rx) = mpsc::channel(16);
        let handle = writer.spawn(rx);

        let uuid = Uuid::new_v4();
        tx.send(record(uuid, PersistedJobState::Up)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(controller.latest(uuid).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_write_times_out_and_writer_drains() {
        let controller = FakeController::new();
        controller.set_hanging_puts(true);
        let writer = PersistWriter::new(
            controller.clone(),
            Duration::from_secs(1),
            Duration::from_millis(100),
            Duration::from_secs(5),
        );
        let (tx, rx) = mpsc::channel(16);
        let handle = writer.spawn(rx);

        let uuid = Uuid::new_v4();
        tx.send(record(uuid, PersistedJobState::Up)).await.unwrap();
        drop(tx);
        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .expect("writer hung on a stalled controller")
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(controller.latest(uuid).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn write_after_timeouts_lands_once_controller_answers() {
        let controller = FakeController::new();
        controller.set_hanging_puts(true);
        let writer = PersistWriter::new(
            controller.clone(),
            Duration::from_secs(1),
            Duration::from_millis(100),
            Duration::from_secs(60),
        );
        let (tx, rx) = mpsc::channel(16);
        let handle = writer.spawn(rx);

        let uuid = Uuid::new_v4();
        tx.send(record(uuid, PersistedJobState::Up)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        controller.set_hanging_puts(false);
        drop(tx);
        handle.await.unwrap();

        assert_eq!(controller.latest(uuid).map(|j| j.state), Some(PersistedJobState::Up));
    }
}
