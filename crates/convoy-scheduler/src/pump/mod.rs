//! Event pump: the single task that owns all scheduler state.
//!
//! Every input (leader changes, job requests, host and formation events,
//! RPC completions, sync triggers, control requests) arrives on its own
//! bounded channel. One `biased` select drains them in priority order,
//! so handlers never race each other and need no locks. Handlers never
//! await collaborators: RPCs run in spawned tasks whose results come
//! back through the completions channel.

mod formations;
mod hosts;
mod jobs;
mod leader;
mod sync;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use convoy_cluster::{
    CheckResult, ClientError, ClientResult, ClusterClient, ControllerClient, Discovery, HostClient, HostTable,
    HostUpdate,
};
use convoy_state::{
    ActiveJob, ControllerJob, DiscoveryEvent, DiscoveryEventKind, ExpandedFormation, FormationKey, FormationTable,
    FormationUpdate, HostId, Instance, JobTable,
};

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{Event, EventBus};
use crate::snapshot::Snapshot;
use crate::streams::spawn_ticker;

/// Request to place one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct JobRequest {
    pub job: Uuid,
    /// Failed placement attempts so far.
    pub attempt: u32,
}

impl JobRequest {
    pub fn new(job: Uuid) -> Self {
        Self { job, attempt: 0 }
    }
}

/// Result of work the pump handed to a spawned task.
pub(crate) enum Completion {
    HostResolved {
        instance: Instance,
        result: ClientResult<Arc<dyn HostClient>>,
    },
    HostChecks(Vec<(HostId, CheckResult)>),
    HostsListed(ClientResult<Vec<Arc<dyn HostClient>>>),
    JobsListed {
        /// Jobs that were on each host when the listing was requested.
        expected: HashSet<Uuid>,
        results: Vec<(HostId, ClientResult<HashMap<String, ActiveJob>>)>,
    },
    FormationsListed {
        requested_at: DateTime<Utc>,
        result: ClientResult<Vec<ExpandedFormation>>,
    },
    FormationFetched {
        key: FormationKey,
        result: ClientResult<ExpandedFormation>,
    },
    JobStarted {
        job: Uuid,
        volumes: Vec<String>,
    },
    StartFailed {
        request: JobRequest,
        host_id: HostId,
        error: ClientError,
    },
    RestartDue(Uuid),
}

/// Requests from a [`crate::SchedulerHandle`].
pub(crate) enum Control {
    Snapshot(oneshot::Sender<Snapshot>),
}

/// Capacity-1 channels that wake the pump for periodic work.
#[derive(Clone)]
pub(crate) struct Triggers {
    pub sync_jobs: mpsc::Sender<()>,
    pub sync_formations: mpsc::Sender<()>,
    pub sync_hosts: mpsc::Sender<()>,
    pub host_checks: mpsc::Sender<()>,
}

/// Receiving ends of every pump input.
pub(crate) struct Inbox {
    pub stop: watch::Receiver<bool>,
    pub requests: mpsc::Receiver<JobRequest>,
    pub host_events: mpsc::Receiver<DiscoveryEvent>,
    pub completions: mpsc::Receiver<Completion>,
    pub host_updates: mpsc::Receiver<HostUpdate>,
    pub services: mpsc::Receiver<DiscoveryEvent>,
    pub formations: mpsc::Receiver<FormationUpdate>,
    pub sync_jobs: mpsc::Receiver<()>,
    pub sync_formations: mpsc::Receiver<()>,
    pub sync_hosts: mpsc::Receiver<()>,
    pub host_checks: mpsc::Receiver<()>,
    pub control: mpsc::Receiver<Control>,
}

/// Sending ends owned by the pump itself.
pub(crate) struct Outlets {
    pub host_updates: mpsc::Sender<HostUpdate>,
    pub requests: mpsc::Sender<JobRequest>,
    pub completions: mpsc::Sender<Completion>,
    pub services: mpsc::Sender<DiscoveryEvent>,
    pub triggers: Triggers,
    pub persist: mpsc::Sender<ControllerJob>,
    pub watermark: watch::Sender<Option<DateTime<Utc>>>,
}

/// Readiness gating for jobs that register a discovery service.
#[derive(Default)]
struct ServiceGate {
    watchers: HashMap<String, JoinHandle<()>>,
    /// Cluster job ids with a registered service instance.
    ready: HashSet<String>,
    /// Cluster job id → job the host reported running but whose
    /// service is not registered yet.
    awaiting: HashMap<String, Uuid>,
}

impl ServiceGate {
    fn forget(&mut self, job_id: &str) {
        self.awaiting.remove(job_id);
    }

    fn close(&mut self) {
        for (_, watcher) in self.watchers.drain() {
            watcher.abort();
        }
    }
}

pub(crate) struct Pump {
    config: SchedulerConfig,
    discovery: Arc<dyn Discovery>,
    controller: Arc<dyn ControllerClient>,
    cluster: Arc<dyn ClusterClient>,
    bus: EventBus,

    /// `None` until registration.
    is_leader: Option<bool>,
    hosts: HostTable,
    formations: FormationTable,
    jobs: JobTable,

    restart_timers: HashMap<Uuid, JoinHandle<()>>,
    /// Placement retries waiting out their delay, one per job.
    retry_timers: HashMap<Uuid, JoinHandle<()>>,
    /// Hosts announced by discovery whose clients are being fetched.
    resolving: HashSet<HostId>,
    formation_lookups: HashSet<FormationKey>,
    rectify_keys: BTreeSet<FormationKey>,
    queued: VecDeque<JobRequest>,
    outbox: VecDeque<ControllerJob>,
    host_checks_running: bool,
    services: ServiceGate,

    outlets: Outlets,
    shutdown: watch::Receiver<bool>,
    tickers: Vec<JoinHandle<()>>,
}

impl Pump {
    pub(crate) fn new(
        config: SchedulerConfig,
        discovery: Arc<dyn Discovery>,
        controller: Arc<dyn ControllerClient>,
        cluster: Arc<dyn ClusterClient>,
        bus: EventBus,
        outlets: Outlets,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let hosts = HostTable::new(outlets.host_updates.clone())
            .with_max_checks(config.max_host_checks)
            .with_retry_delay(config.stream_retry_delay);
        Self {
            config,
            discovery,
            controller,
            cluster,
            bus,
            is_leader: None,
            hosts,
            formations: FormationTable::new(),
            jobs: JobTable::new(),
            restart_timers: HashMap::new(),
            retry_timers: HashMap::new(),
            resolving: HashSet::new(),
            formation_lookups: HashSet::new(),
            rectify_keys: BTreeSet::new(),
            queued: VecDeque::new(),
            outbox: VecDeque::new(),
            host_checks_running: false,
            services: ServiceGate::default(),
            outlets,
            shutdown,
            tickers: Vec::new(),
        }
    }

    /// Run until stopped: wait for the initial snapshots, register with
    /// discovery, then process inputs.
    pub(crate) async fn run(mut self, mut inbox: Inbox) -> SchedulerResult<()> {
        let result = self.run_inner(&mut inbox).await;
        self.close().await;
        result
    }

    async fn run_inner(&mut self, inbox: &mut Inbox) -> SchedulerResult<()> {
        if !self.wait_for_snapshots(inbox).await? {
            return Ok(());
        }
        info!(
            hosts = self.hosts.len(),
            formations = self.formations.len(),
            "initial cluster state loaded"
        );

        let is_leader = convoy_cluster::with_timeout(self.config.rpc_timeout, self.discovery.register())
            .await
            .map_err(SchedulerError::Registration)?;
        let leader_rx = self
            .discovery
            .leader_changes()
            .await
            .map_err(SchedulerError::Registration)?;
        info!(is_leader, "registered with discovery");

        self.spawn_tickers();
        self.handle_leader_change(is_leader);
        self.flush_outbox().await;

        self.event_loop(inbox, leader_rx).await;
        Ok(())
    }

    /// Drain host and formation streams until both have delivered their
    /// initial snapshot. Returns `false` if stopped meanwhile.
    async fn wait_for_snapshots(&mut self, inbox: &mut Inbox) -> SchedulerResult<bool> {
        if *inbox.stop.borrow() {
            return Ok(false);
        }
        let deadline = tokio::time::sleep(self.config.startup_timeout);
        tokio::pin!(deadline);

        let mut hosts_current = false;
        let mut formations_current = false;
        while !(hosts_current && formations_current && self.resolving.is_empty()) {
            tokio::select! {
                _ = inbox.stop.changed() => return Ok(false),
                _ = &mut deadline => {
                    let what = if !formations_current { "formation" } else { "host" };
                    error!(hosts_current, formations_current, "timed out waiting for cluster state");
                    return Err(SchedulerError::StartupTimeout(what));
                }
                Some(event) = inbox.host_events.recv() => {
                    if event.kind == DiscoveryEventKind::Current {
                        hosts_current = true;
                    } else {
                        self.handle_host_event(event);
                    }
                }
                Some(update) = inbox.formations.recv() => match update {
                    FormationUpdate::Current => formations_current = true,
                    FormationUpdate::Formation(ef) => self.apply_formation(ef),
                },
                Some(completion) = inbox.completions.recv() => self.handle_completion(completion),
            }
        }
        Ok(true)
    }

    async fn event_loop(&mut self, inbox: &mut Inbox, mut leader_rx: mpsc::Receiver<bool>) {
        let mut leader_open = true;
        loop {
            if *inbox.stop.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = inbox.stop.changed() => break,
                changed = leader_rx.recv(), if leader_open => match changed {
                    Some(is_leader) => self.handle_leader_change(is_leader),
                    None => {
                        warn!("leader stream closed");
                        leader_open = false;
                    }
                },
                _ = std::future::ready(()), if !self.queued.is_empty() => {
                    if let Some(request) = self.queued.pop_front() {
                        self.process_request(request);
                    }
                }
                Some(request) = inbox.requests.recv() => self.retry_due(request),
                Some(event) = inbox.host_events.recv() => self.handle_host_event(event),
                Some(completion) = inbox.completions.recv() => self.handle_completion(completion),
                Some(update) = inbox.host_updates.recv() => self.handle_host_update(update),
                Some(event) = inbox.services.recv() => self.handle_service_event(event),
                Some(update) = inbox.formations.recv() => match update {
                    FormationUpdate::Formation(ef) => self.apply_formation(ef),
                    FormationUpdate::Current => trace!("formation stream current"),
                },
                Some(()) = inbox.sync_jobs.recv() => self.sync_jobs(),
                Some(()) = inbox.sync_formations.recv() => self.sync_formations(),
                Some(()) = inbox.sync_hosts.recv() => self.sync_hosts(),
                Some(()) = inbox.host_checks.recv() => self.check_hosts(),
                _ = std::future::ready(()), if !self.rectify_keys.is_empty() => self.rectify_pending(),
                Some(control) = inbox.control.recv() => self.handle_control(control),
            }
            self.flush_outbox().await;
        }
        info!("scheduler stopping");
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::HostResolved { instance, result } => self.host_resolved(instance, result),
            Completion::HostChecks(results) => self.host_checks_done(results),
            Completion::HostsListed(result) => self.hosts_listed(result),
            Completion::JobsListed { expected, results } => self.jobs_listed(expected, results),
            Completion::FormationsListed { requested_at, result } => self.formations_listed(requested_at, result),
            Completion::FormationFetched { key, result } => self.formation_fetched(key, result),
            Completion::JobStarted { job, volumes } => self.job_started(job, volumes),
            Completion::StartFailed {
                request,
                host_id,
                error,
            } => self.start_failed(request, host_id, error),
            Completion::RestartDue(id) => self.restart_due(id),
        }
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Snapshot(reply) => {
                let _ = reply.send(Snapshot::capture(
                    self.is_leader,
                    &self.hosts,
                    &self.formations,
                    &self.jobs,
                ));
            }
        }
    }

    fn spawn_tickers(&mut self) {
        let triggers = &self.outlets.triggers;
        self.tickers = vec![
            spawn_ticker(
                "sync-jobs",
                self.config.sync_jobs_interval,
                triggers.sync_jobs.clone(),
                self.shutdown.clone(),
            ),
            spawn_ticker(
                "sync-formations",
                self.config.sync_formations_interval,
                triggers.sync_formations.clone(),
                self.shutdown.clone(),
            ),
            spawn_ticker(
                "sync-hosts",
                self.config.sync_hosts_interval,
                triggers.sync_hosts.clone(),
                self.shutdown.clone(),
            ),
        ];
    }

    async fn close(&mut self) {
        for (_, timer) in self.restart_timers.drain().chain(self.retry_timers.drain()) {
            timer.abort();
        }
        for ticker in self.tickers.drain(..) {
            ticker.abort();
        }
        self.services.close();
        self.hosts.close_all();
        self.flush_outbox().await;
        debug!(jobs = self.jobs.len(), "pump closed");
    }

    // ── Shared helpers ──────────────────────────────────────────────

    fn is_leader(&self) -> bool {
        self.is_leader == Some(true)
    }

    /// Run `work` in a task and feed its result back as a completion.
    fn complete<F>(&self, work: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let tx = self.outlets.completions.clone();
        tokio::spawn(async move {
            let completion = work.await;
            let _ = tx.send(completion).await;
        });
    }

    fn publish(&self, event: Event) {
        self.bus.publish(event);
    }

    /// Queue the job's current record for the controller, if this
    /// scheduler leads and the state is externally visible.
    fn persist(&mut self, id: &Uuid) {
        if !self.is_leader() {
            return;
        }
        let record = self
            .jobs
            .get(id)
            .filter(|job| job.job_id.is_some())
            .and_then(|job| job.to_controller());
        if let Some(record) = record {
            self.outbox.push_back(record);
        }
    }

    async fn flush_outbox(&mut self) {
        while let Some(record) = self.outbox.pop_front() {
            if self.outlets.persist.send(record).await.is_err() {
                warn!(dropped = self.outbox.len() + 1, "persistence writer gone");
                self.outbox.clear();
                return;
            }
        }
    }

    fn trigger_rectify(&mut self, key: FormationKey) {
        self.rectify_keys.insert(key);
    }

    fn rectify_all(&mut self) {
        let keys: Vec<FormationKey> = self.formations.keys().cloned().collect();
        self.rectify_keys.extend(keys);
    }

    /// Re-queue every job still waiting for placement, except those with
    /// a retry already pending.
    fn requeue_new_jobs(&mut self) {
        let mut waiting = self.jobs.in_state(convoy_state::JobState::New);
        waiting.sort();
        for id in waiting {
            if !self.retry_timers.contains_key(&id) && !self.queued.iter().any(|r| r.job == id) {
                self.queued.push_back(JobRequest::new(id));
            }
        }
    }
}

/// Current time as a std instant, following tokio's clock.
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}
