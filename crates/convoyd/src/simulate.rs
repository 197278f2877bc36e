//! Run a scheduler against a simulated cluster built from a scenario.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use convoy_scheduler::{Event, Scheduler, SchedulerConfig, Snapshot, Subscription};
use convoy_sim::{FakeCluster, FakeController, FakeDiscovery, FakeHost};
use convoy_state::{FormationKey, Job, JobState};

use crate::scenario::{Action, Scenario, duration};

/// The simulated collaborators of one run.
struct World {
    discovery: Arc<FakeDiscovery>,
    controller: Arc<FakeController>,
    cluster: Arc<FakeCluster>,
    /// Every host ever added, including removed ones.
    hosts: BTreeMap<String, Arc<FakeHost>>,
}

impl World {
    fn build(scenario: &Scenario) -> Self {
        let discovery = FakeDiscovery::new(scenario.leader);
        let controller = FakeController::new();
        let cluster = FakeCluster::new();
        let mut hosts = BTreeMap::new();
        for spec in &scenario.hosts {
            let host = FakeHost::with_tags(&spec.id, spec.tags.clone());
            cluster.add_host(host.clone());
            hosts.insert(spec.id.clone(), host);
        }
        for formation in &scenario.formations {
            controller.set_formation(formation.build());
        }
        Self {
            discovery,
            controller,
            cluster,
            hosts,
        }
    }

    fn apply(&mut self, action: &Action) -> anyhow::Result<()> {
        info!(?action, "applying step");
        match action {
            Action::AddHost { id, tags } => {
                let host = FakeHost::with_tags(id, tags.clone());
                self.cluster.add_host(host.clone());
                self.hosts.insert(id.clone(), host);
            }
            Action::ShutdownHost { id } => {
                self.cluster
                    .shutdown_host(id)
                    .with_context(|| format!("unknown host {id}"))?;
            }
            Action::FailHost { id } => {
                self.host(id)?.set_healthy(false);
                self.cluster.remove_host(id);
            }
            Action::RecoverHost { id } => {
                let host = self.host(id)?;
                host.set_healthy(true);
                self.cluster.add_host(host);
            }
            Action::Scale {
                app,
                release,
                process,
                count,
            } => {
                let key = FormationKey::new(app, release);
                if !self.controller.scale(&key, process, *count) {
                    anyhow::bail!("unknown formation {key}");
                }
            }
            Action::CrashJob { host } => {
                let host = self.host(host)?;
                match host.job_ids().first() {
                    Some(job_id) => {
                        host.crash(job_id);
                    }
                    None => warn!(host_id = %host.host_id(), "no job to crash"),
                }
            }
            Action::SetLeader { is_leader } => self.discovery.set_leader(*is_leader),
        }
        Ok(())
    }

    fn host(&self, id: &str) -> anyhow::Result<Arc<FakeHost>> {
        self.hosts
            .get(id)
            .cloned()
            .with_context(|| format!("unknown host {id}"))
    }
}

/// Run `scenario` until `run_for` elapses or ctrl-c, then return the
/// scheduler's final snapshot.
pub async fn run(scenario: Scenario, config: SchedulerConfig, run_for: Option<Duration>) -> anyhow::Result<Snapshot> {
    let mut world = World::build(&scenario);
    let scheduler = Scheduler::new(
        config,
        world.discovery.clone(),
        world.controller.clone(),
        world.cluster.clone(),
    );
    let handle = scheduler.handle();
    let (done_tx, done_rx) = watch::channel(false);
    let services = spawn_service_registrar(&scenario, handle.subscribe(), world.discovery.clone(), done_rx.clone());
    let logger = spawn_event_logger(handle.subscribe(), done_rx);
    let mut task = tokio::spawn(scheduler.run());

    // ── Timeline ──
    let timeline = async {
        for step in &scenario.steps {
            tokio::time::sleep(duration(&step.after)?).await;
            world.apply(&step.action)?;
        }
        match run_for {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
        anyhow::Ok(())
    };

    tokio::select! {
        result = timeline => if let Err(err) = result {
            handle.stop();
            let _ = done_tx.send(true);
            return Err(err);
        },
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
        joined = &mut task => {
            let _ = done_tx.send(true);
            joined??;
            anyhow::bail!("scheduler exited early");
        }
    }

    let snapshot = handle.snapshot().await?;
    handle.stop();
    let _ = done_tx.send(true);
    task.await??;
    for worker in [services, logger] {
        worker.await?;
    }
    summarize(&snapshot, &world);
    Ok(snapshot)
}

fn summarize(snapshot: &Snapshot, world: &World) {
    info!(
        leader = ?snapshot.is_leader,
        hosts = snapshot.hosts.len(),
        formations = snapshot.formations.len(),
        running = snapshot.jobs_in_state(JobState::Running).len(),
        stopped = snapshot.jobs_in_state(JobState::Stopped).len(),
        job_writes = world.controller.puts().len(),
        "simulation finished"
    );
    for (id, host) in &world.hosts {
        debug!(host_id = %id, jobs = host.job_count(), calls = host.calls().len(), "host summary");
    }
}

/// Register a discovery instance for every started job whose type names
/// a service, as a real job would once it is up.
fn spawn_service_registrar(
    scenario: &Scenario,
    mut events: Subscription,
    discovery: Arc<FakeDiscovery>,
    mut done: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let services = scenario.services();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = done.changed() => return,
            };
            let Some(event) = event else {
                return;
            };
            if let Event::JobStart { job } = &event {
                if let Some((service, job_id)) = service_for(&services, job) {
                    debug!(%service, %job_id, "registering service instance");
                    discovery.service_up(service, job_id, job_id);
                }
            }
        }
    })
}

fn service_for<'a>(services: &'a BTreeMap<(FormationKey, String), String>, job: &'a Job) -> Option<(&'a str, &'a str)> {
    let key = job.formation.clone()?;
    let service = services.get(&(key, job.job_type.clone()))?;
    Some((service.as_str(), job.job_id.as_deref()?))
}

fn spawn_event_logger(mut events: Subscription, mut done: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => info!(kind = ?event.kind(), ?event, "scheduler event"),
                    None => return,
                },
                _ = done.changed() => return,
            }
        }
    })
}
