//! Host membership, health checks and service readiness.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use convoy_cluster::{CheckResult, ClientResult, HealthVerdict, HostClient, with_timeout};
use convoy_state::{DiscoveryEvent, DiscoveryEventKind, Formation, HostId, Instance, JobState};

use super::{Completion, Pump};
use crate::events::{Event, HostEventKind};
use crate::streams::{fire, fire_after, spawn_watcher};

impl Pump {
    // ── Discovery ───────────────────────────────────────────────────

    pub(super) fn handle_host_event(&mut self, event: DiscoveryEvent) {
        let Some(instance) = event.instance else {
            return;
        };
        match event.kind {
            DiscoveryEventKind::Up | DiscoveryEventKind::Update => {
                if self.hosts.contains(&instance.id) {
                    self.host_updated(&instance);
                } else {
                    self.resolve_host(instance);
                }
            }
            DiscoveryEventKind::Down => self.host_down(&instance),
            DiscoveryEventKind::Current => {}
        }
    }

    fn resolve_host(&mut self, instance: Instance) {
        if !self.resolving.insert(instance.id.clone()) {
            return;
        }
        debug!(host_id = %instance.id, "resolving host");
        let cluster = self.cluster.clone();
        let timeout = self.config.rpc_timeout;
        self.complete(async move {
            let result = with_timeout(timeout, cluster.host(&instance.id)).await;
            Completion::HostResolved { instance, result }
        });
    }

    pub(super) fn host_resolved(&mut self, instance: Instance, result: ClientResult<Arc<dyn HostClient>>) {
        self.resolving.remove(&instance.id);
        match result {
            Ok(client) => {
                if self.add_host(client) {
                    self.host_updated(&instance);
                }
            }
            Err(e) => warn!(host_id = %instance.id, error = %e, "failed to resolve host"),
        }
    }

    /// Follow a host. Returns `false` if it was already followed.
    fn add_host(&mut self, client: Arc<dyn HostClient>) -> bool {
        let host_id = client.id().to_string();
        if !self.hosts.follow(client) {
            return false;
        }
        self.publish(Event::HostEvent {
            host_id,
            kind: HostEventKind::Up,
        });
        self.rectify_all();
        self.requeue_new_jobs();
        true
    }

    /// Apply tags and the shutdown flag carried in discovery metadata.
    fn host_updated(&mut self, instance: &Instance) {
        let tags = instance.host_tags();
        let mut changed = !tags.is_empty() && self.hosts.update_tags(&instance.id, tags);
        if instance.is_shutdown() {
            changed |= self.hosts.mark_shutdown(&instance.id);
        }
        if changed {
            self.publish(Event::HostEvent {
                host_id: instance.id.clone(),
                kind: HostEventKind::Updated,
            });
            self.rectify_all();
        }
    }

    fn host_down(&mut self, instance: &Instance) {
        let Some(host) = self.hosts.get(&instance.id) else {
            return;
        };
        if host.shutdown || instance.is_shutdown() {
            info!(host_id = %instance.id, "host shut down");
            self.remove_host(&instance.id);
        } else {
            self.host_unhealthy(&instance.id);
        }
    }

    pub(super) fn host_stream_lost(&mut self, host_id: &str) {
        if self.hosts.contains(host_id) {
            self.host_unhealthy(host_id);
        }
    }

    fn host_unhealthy(&mut self, host_id: &str) {
        if self.hosts.mark_unhealthy(host_id) {
            self.publish(Event::HostEvent {
                host_id: host_id.to_string(),
                kind: HostEventKind::Unhealthy,
            });
            fire(&self.outlets.triggers.host_checks);
        }
    }

    /// Unfollow a host and write off every job bound to it.
    pub(super) fn remove_host(&mut self, host_id: &str) {
        if self.hosts.unfollow(host_id).is_none() {
            return;
        }
        let lost: Vec<Uuid> = self
            .jobs
            .on_host(host_id)
            .filter(|job| job.state != JobState::Stopped)
            .map(|job| job.id)
            .collect();
        for id in lost {
            self.job_lost(id);
        }
        self.publish(Event::HostEvent {
            host_id: host_id.to_string(),
            kind: HostEventKind::Down,
        });
        self.rectify_all();
    }

    // ── Health checks ───────────────────────────────────────────────

    pub(super) fn check_hosts(&mut self) {
        if self.host_checks_running {
            return;
        }
        let targets: Vec<(HostId, Arc<dyn HostClient>)> = self
            .hosts
            .iter()
            .filter(|host| !host.is_healthy())
            .map(|host| (host.id().to_string(), host.client()))
            .collect();
        if targets.is_empty() {
            return;
        }
        self.host_checks_running = true;
        let timeout = self.config.rpc_timeout;
        self.complete(async move {
            let mut results = Vec::with_capacity(targets.len());
            for (host_id, client) in targets {
                let check = match with_timeout(timeout, client.get_status()).await {
                    Ok(_) => CheckResult::Healthy,
                    Err(e) => {
                        debug!(%host_id, error = %e, "host status check failed");
                        CheckResult::Failed
                    }
                };
                results.push((host_id, check));
            }
            Completion::HostChecks(results)
        });
    }

    pub(super) fn host_checks_done(&mut self, results: Vec<(HostId, CheckResult)>) {
        self.host_checks_running = false;
        for (host_id, check) in results {
            match self.hosts.record_check(&host_id, check) {
                Some(HealthVerdict::Healthy) => {
                    info!(%host_id, "host healthy again");
                    self.publish(Event::HostEvent {
                        host_id,
                        kind: HostEventKind::Healthy,
                    });
                    self.rectify_all();
                    self.requeue_new_jobs();
                }
                Some(HealthVerdict::Dead) => self.remove_host(&host_id),
                Some(HealthVerdict::Unhealthy) | None => {}
            }
        }
        if !self.hosts.unhealthy().is_empty() {
            fire_after(
                self.outlets.triggers.host_checks.clone(),
                self.config.host_check_interval,
            );
        }
    }

    // ── Host sync ───────────────────────────────────────────────────

    pub(super) fn sync_hosts(&mut self) {
        debug!("syncing hosts");
        let cluster = self.cluster.clone();
        let timeout = self.config.rpc_timeout;
        self.complete(async move { Completion::HostsListed(with_timeout(timeout, cluster.hosts()).await) });
    }

    pub(super) fn hosts_listed(&mut self, result: ClientResult<Vec<Arc<dyn HostClient>>>) {
        let clients = match result {
            Ok(clients) => clients,
            Err(e) => {
                warn!(error = %e, "failed to list hosts");
                fire_after(
                    self.outlets.triggers.sync_hosts.clone(),
                    self.config.sync_retry_delay,
                );
                return;
            }
        };

        let listed: HashSet<HostId> = clients.iter().map(|c| c.id().to_string()).collect();
        for client in clients {
            if !self.hosts.contains(client.id()) {
                info!(host_id = %client.id(), "host found by sync");
                self.add_host(client);
            }
        }
        for host_id in self.hosts.ids() {
            if !listed.contains(&host_id) {
                debug!(%host_id, "followed host missing from cluster listing");
                self.host_unhealthy(&host_id);
            }
        }
    }

    // ── Service readiness ───────────────────────────────────────────

    /// Watch every service named by the formation's process types.
    pub(super) fn watch_services(&mut self, formation: &Formation) {
        for process in formation.release.processes.values() {
            let Some(service) = process.service.clone() else {
                continue;
            };
            if self.services.watchers.contains_key(&service) {
                continue;
            }
            info!(%service, "watching service");
            let discovery = self.discovery.clone();
            let name = service.clone();
            let watcher = spawn_watcher(
                "service",
                move || {
                    let discovery = discovery.clone();
                    let name = name.clone();
                    async move { discovery.watch(&name).await }
                },
                self.outlets.services.clone(),
                self.config.stream_retry_delay,
                self.shutdown.clone(),
            );
            self.services.watchers.insert(service, watcher);
        }
    }

    pub(super) fn handle_service_event(&mut self, event: DiscoveryEvent) {
        let Some(job_id) = event
            .instance
            .as_ref()
            .and_then(Instance::job_id)
            .map(str::to_string)
        else {
            return;
        };
        match event.kind {
            DiscoveryEventKind::Up | DiscoveryEventKind::Update => {
                self.services.ready.insert(job_id.clone());
                if let Some(id) = self.services.awaiting.remove(&job_id) {
                    self.service_ready(id, &job_id);
                }
            }
            DiscoveryEventKind::Down => {
                self.services.ready.remove(&job_id);
            }
            DiscoveryEventKind::Current => {}
        }
    }

    fn service_ready(&mut self, id: Uuid, job_id: &str) {
        let promoted = self
            .jobs
            .update(&id, |job| {
                let starting = job.state == JobState::Starting;
                if starting {
                    job.state = JobState::Running;
                }
                starting
            })
            .unwrap_or(false);
        if promoted {
            info!(job = %id, %job_id, "service registered, job running");
            self.persist(&id);
            if let Some(key) = self.jobs.get(&id).and_then(|job| job.formation.clone()) {
                self.trigger_rectify(key);
            }
        }
    }

    /// Whether a job the host reports running must wait for its service
    /// to register before it counts as running.
    pub(super) fn awaits_service(&mut self, id: Uuid, job_id: &str) -> bool {
        let has_service = self
            .jobs
            .get(&id)
            .and_then(|job| {
                let key = job.formation.as_ref()?;
                self.formations.get(key)?.process(&job.job_type)
            })
            .is_some_and(|process| process.service.is_some());
        if !has_service || self.services.ready.contains(job_id) {
            return false;
        }
        self.services.awaiting.insert(job_id.to_string(), id);
        true
    }
}
