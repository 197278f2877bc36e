//! Scheduler entry point and its external handle.
//!
//! `Scheduler::run` wires the collaborator streams, the persistence
//! writer and the event pump together and drives them until stopped.
//! A [`SchedulerHandle`] can be taken before `run` to subscribe to
//! events, read snapshots and request shutdown.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info};

use convoy_cluster::{ClusterClient, ControllerClient, Discovery};

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{EventBus, Subscription};
use crate::persist::PersistWriter;
use crate::pump::{Control, Inbox, Outlets, Pump, Triggers};
use crate::snapshot::Snapshot;
use crate::streams::spawn_watcher;

pub struct Scheduler {
    config: SchedulerConfig,
    discovery: Arc<dyn Discovery>,
    controller: Arc<dyn ControllerClient>,
    cluster: Arc<dyn ClusterClient>,
    bus: EventBus,
    control_tx: mpsc::Sender<Control>,
    control_rx: mpsc::Receiver<Control>,
    stop: Arc<watch::Sender<bool>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        discovery: Arc<dyn Discovery>,
        controller: Arc<dyn ControllerClient>,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (stop, _) = watch::channel(false);
        Self {
            config,
            discovery,
            controller,
            cluster,
            bus: EventBus::new(),
            control_tx,
            control_rx,
            stop: Arc::new(stop),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            bus: self.bus.clone(),
            control: self.control_tx.clone(),
            stop: self.stop.clone(),
            subscriber_capacity: self.config.subscriber_capacity,
        }
    }

    /// Subscribe to scheduler events with the configured capacity.
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe(self.config.subscriber_capacity)
    }

    /// Run until [`SchedulerHandle::stop`] is called or startup fails.
    pub async fn run(self) -> SchedulerResult<()> {
        self.config.validate()?;
        let Self {
            config,
            discovery,
            controller,
            cluster,
            bus,
            control_tx,
            control_rx,
            stop,
        } = self;
        // Handles keep their own senders; this one would keep the
        // control channel open after every handle is gone.
        drop(control_tx);

        let capacity = config.channel_capacity;
        let shutdown = stop.subscribe();

        let (request_tx, request_rx) = mpsc::channel(capacity);
        let (host_event_tx, host_event_rx) = mpsc::channel(capacity);
        let (completion_tx, completion_rx) = mpsc::channel(capacity);
        let (host_update_tx, host_update_rx) = mpsc::channel(capacity);
        let (service_tx, service_rx) = mpsc::channel(capacity);
        let (formation_tx, formation_rx) = mpsc::channel(capacity);
        let (persist_tx, persist_rx) = mpsc::channel(capacity);
        let (sync_jobs_tx, sync_jobs_rx) = mpsc::channel(1);
        let (sync_formations_tx, sync_formations_rx) = mpsc::channel(1);
        let (sync_hosts_tx, sync_hosts_rx) = mpsc::channel(1);
        let (host_checks_tx, host_checks_rx) = mpsc::channel(1);
        let (watermark_tx, watermark_rx) = watch::channel(None);

        // ── Collaborator streams ──
        let host_watcher = {
            let cluster = cluster.clone();
            spawn_watcher(
                "host-events",
                move || {
                    let cluster = cluster.clone();
                    async move { cluster.stream_host_events().await }
                },
                host_event_tx,
                config.stream_retry_delay,
                shutdown.clone(),
            )
        };
        let formation_watcher = {
            let controller = controller.clone();
            spawn_watcher(
                "formations",
                move || {
                    let controller = controller.clone();
                    // Reconnects resume from the newest formation seen.
                    let since = *watermark_rx.borrow();
                    async move { controller.stream_formations(since).await }
                },
                formation_tx,
                config.stream_retry_delay,
                shutdown.clone(),
            )
        };

        let writer = PersistWriter::new(
            controller.clone(),
            config.rpc_timeout,
            config.persist_retry_delay,
            config.persist_retry_total,
        )
        .spawn(persist_rx);

        let outlets = Outlets {
            host_updates: host_update_tx,
            requests: request_tx,
            completions: completion_tx,
            services: service_tx,
            triggers: Triggers {
                sync_jobs: sync_jobs_tx,
                sync_formations: sync_formations_tx,
                sync_hosts: sync_hosts_tx,
                host_checks: host_checks_tx,
            },
            persist: persist_tx,
            watermark: watermark_tx,
        };
        let inbox = Inbox {
            stop: stop.subscribe(),
            requests: request_rx,
            host_events: host_event_rx,
            completions: completion_rx,
            host_updates: host_update_rx,
            services: service_rx,
            formations: formation_rx,
            sync_jobs: sync_jobs_rx,
            sync_formations: sync_formations_rx,
            sync_hosts: sync_hosts_rx,
            host_checks: host_checks_rx,
            control: control_rx,
        };

        info!(scheduler_config = ?config, "scheduler starting");
        let pump = Pump::new(config, discovery, controller, cluster, bus, outlets, shutdown);
        let result = pump.run(inbox).await;

        stop.send_replace(true);
        for watcher in [host_watcher, formation_watcher] {
            if let Err(e) = watcher.await {
                error!(error = %e, "stream watcher failed");
            }
        }
        // The pump owned the only persistence sender; the writer drains
        // what was queued and exits.
        if let Err(e) = writer.await {
            error!(error = %e, "persistence writer failed");
        }
        match &result {
            Ok(()) => info!("scheduler stopped"),
            Err(e) => error!(error = %e, "scheduler failed"),
        }
        result
    }
}

/// Cloneable handle to a scheduler, usable from any task.
#[derive(Clone)]
pub struct SchedulerHandle {
    bus: EventBus,
    control: mpsc::Sender<Control>,
    stop: Arc<watch::Sender<bool>>,
    subscriber_capacity: usize,
}

impl SchedulerHandle {
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe(self.subscriber_capacity)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        self.bus.subscribe(capacity)
    }

    /// Current view of hosts, formations and jobs.
    pub async fn snapshot(&self) -> SchedulerResult<Snapshot> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Snapshot(tx))
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("subscribers", &self.bus.subscriber_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
