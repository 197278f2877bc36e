//! Job lifecycle: host reports, placement, stops and restarts.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use convoy_cluster::{ClientError, HostClient, HostUpdate, with_timeout};
use convoy_placement::{candidates, choose_host};
use convoy_state::{
    HostId, HostJobEvent, HostJobStatus, Job, JobConfig, JobMetadata, JobState, StateError, StopReason,
};

use super::{Completion, JobRequest, Pump, now};
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::Event;
use crate::reconcile::desired_count;
use crate::restart::plan_restart;

/// Outcome of applying a host report to a job.
enum Transition {
    To(JobState),
    Stop(StopReason),
}

impl Pump {
    pub(super) fn handle_host_update(&mut self, update: HostUpdate) {
        match update {
            HostUpdate::Job(event) => self.handle_job_event(event),
            HostUpdate::StreamLost { host_id } => self.host_stream_lost(&host_id),
        }
    }

    // ── Host reports ────────────────────────────────────────────────

    pub(super) fn handle_job_event(&mut self, event: HostJobEvent) {
        let HostJobEvent {
            host_id,
            job: report,
            source,
        } = event;
        if !self.hosts.contains(&host_id) {
            debug!(%host_id, job_id = %report.job_id, "ignoring report from unfollowed host");
            return;
        }
        let metadata = match JobMetadata::decode(&report.metadata) {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(%host_id, job_id = %report.job_id, error = %e, "ignoring job without scheduler metadata");
                return;
            }
        };
        let id = metadata.scheduler_id;

        if !self.jobs.contains(&id) {
            if report.status.is_terminal() {
                debug!(job = %id, %host_id, status = ?report.status, "ignoring terminal report for unknown job");
                return;
            }
            self.adopt(&host_id, &report.job_id, metadata);
        }
        let Some(job) = self.jobs.get(&id) else {
            return;
        };

        let owned = job.host_id.as_deref().is_none_or(|h| h == host_id)
            && job.job_id.as_deref().is_none_or(|j| j == report.job_id);
        if !owned {
            warn!(
                job = %id,
                %host_id,
                job_id = %report.job_id,
                owner = ?job.host_id,
                "job reported by a host that does not own it"
            );
            if !report.status.is_terminal() {
                self.stop_on_host(&host_id, &report.job_id);
            }
            return;
        }

        let prev = job.state;
        let transition = match report.status {
            HostJobStatus::Starting => match prev {
                JobState::New | JobState::Pending => Some(Transition::To(JobState::Starting)),
                _ => None,
            },
            HostJobStatus::Running => match prev {
                JobState::New | JobState::Pending | JobState::Starting => {
                    if self.awaits_service(id, &report.job_id) {
                        (prev != JobState::Starting).then_some(Transition::To(JobState::Starting))
                    } else {
                        Some(Transition::To(JobState::Running))
                    }
                }
                JobState::Stopped => {
                    warn!(job = %id, %host_id, "stopped job still running, stopping it");
                    self.stop_on_host(&host_id, &report.job_id);
                    None
                }
                _ => None,
            },
            status => match prev {
                JobState::Stopped => None,
                JobState::Stopping => Some(Transition::Stop(StopReason::Requested)),
                _ => status.stop_reason().map(Transition::Stop),
            },
        };
        let Some(transition) = transition else {
            return;
        };

        let now = now();
        let started_at = reported_start(report.started_at, now);
        let next = self.jobs.update(&id, |job| {
            job.host_id = Some(host_id.clone());
            job.job_id = Some(report.job_id.clone());
            job.started_at.get_or_insert(started_at);
            match transition {
                Transition::To(state) => job.state = state,
                Transition::Stop(reason) => {
                    job.state = JobState::Stopped;
                    job.stop_reason = Some(reason);
                    job.stopped_at = Some(now);
                    job.exit_status = report.exit_status;
                    job.host_error = report.host_error.clone();
                }
            }
            job.state
        });
        let Some(next) = next else {
            return;
        };
        debug!(job = %id, %host_id, from = %prev, to = %next, ?source, "job state changed");

        self.persist(&id);
        let Some(job) = self.jobs.get(&id).cloned() else {
            return;
        };
        match next {
            JobState::Starting | JobState::Running if matches!(prev, JobState::New | JobState::Pending) => {
                info!(job = %id, %host_id, job_id = %report.job_id, job_type = %job.job_type, "job started");
                self.publish(Event::JobStart { job: job.clone() });
            }
            JobState::Stopped => {
                info!(
                    job = %id,
                    %host_id,
                    reason = ?job.stop_reason,
                    exit_status = ?job.exit_status,
                    "job stopped"
                );
                self.services.forget(&report.job_id);
                self.publish(Event::JobStop { job: job.clone() });
            }
            _ => {}
        }

        let Some(key) = job.formation.clone() else {
            self.lookup_formation(job.formation_key());
            return;
        };
        if !self.is_leader() {
            return;
        }
        if next == JobState::Stopped && job.stop_reason.is_some_and(StopReason::is_crash) {
            self.maybe_restart(&job);
        }
        // A scheduled restart counts as active, so this only fills gaps
        // the restart policy left.
        self.trigger_rectify(key);
    }

    /// Track a job first seen in a host report.
    fn adopt(&mut self, host_id: &str, job_id: &str, metadata: JobMetadata) {
        let mut job = Job::discovered(host_id, job_id, metadata);
        let key = job.formation_key();
        if self.formations.contains(&key) {
            job.formation = Some(key);
        } else {
            self.lookup_formation(key);
        }
        info!(job = %job.id, %host_id, %job_id, job_type = %job.job_type, "discovered job");
        self.jobs.insert(job);
    }

    // ── Placement ───────────────────────────────────────────────────

    pub(super) fn process_request(&mut self, request: JobRequest) {
        if let Err(e) = self.place(request) {
            debug!(job = %request.job, attempt = request.attempt, error = %e, "job request dropped");
        }
    }

    fn place(&mut self, request: JobRequest) -> SchedulerResult<()> {
        if !self.is_leader() {
            return Err(SchedulerError::NotLeader);
        }
        let job = self
            .jobs
            .get(&request.job)
            .ok_or(StateError::JobNotFound(request.job))?;
        if job.state != JobState::New {
            return Err(SchedulerError::JobNotPending(request.job));
        }
        let job_type = job.job_type.clone();
        let formation = job
            .formation
            .as_ref()
            .and_then(|key| self.formations.get(key))
            .filter(|formation| formation.is_schedulable(&job_type))
            .cloned();
        let Some(formation) = formation else {
            info!(job = %request.job, %job_type, "formation no longer runs this type, cancelling");
            self.mark_stopped(&request.job, StopReason::Cancelled);
            return Ok(());
        };

        let required = formation.required_tags(&job_type);
        let candidates = candidates(&self.hosts, &self.jobs, &formation.key, &job_type);
        let host_id = match choose_host(&candidates, &required) {
            Ok(chosen) => chosen.host_id.clone(),
            Err(e) => {
                self.retry_request(request, e.to_string());
                return Ok(());
            }
        };
        let client = self
            .hosts
            .get(&host_id)
            .map(|host| host.client())
            .ok_or_else(|| SchedulerError::HostIsDown(host_id.clone()))?;

        let job_id = format!("{host_id}-{}", request.job);
        self.jobs.update(&request.job, |job| {
            job.host_id = Some(host_id.clone());
            job.job_id = Some(job_id.clone());
            job.state = JobState::Pending;
        });
        let Some(config) = self
            .jobs
            .get(&request.job)
            .and_then(|job| JobConfig::for_job(job, &formation))
        else {
            return Ok(());
        };
        let needs_volume = formation.process(&job_type).is_some_and(|p| p.data);

        info!(
            job = %request.job,
            %host_id,
            %job_id,
            formation = %formation.key,
            %job_type,
            attempt = request.attempt,
            "placing job"
        );
        let timeout = self.config.rpc_timeout;
        self.complete(start_job(client, config, needs_volume, timeout, request, host_id));
        Ok(())
    }

    pub(super) fn job_started(&mut self, id: Uuid, volumes: Vec<String>) {
        debug!(job = %id, ?volumes, "job accepted by host");
        if !volumes.is_empty() {
            self.jobs.update(&id, |job| job.volumes = volumes);
        }
    }

    pub(super) fn start_failed(&mut self, request: JobRequest, host_id: HostId, error: ClientError) {
        warn!(job = %request.job, %host_id, error = %error, "failed to start job");
        let reset = self
            .jobs
            .update(&request.job, |job| {
                let placed_here = job.state == JobState::Pending && job.host_id.as_deref() == Some(host_id.as_str());
                if placed_here {
                    job.state = JobState::New;
                    job.host_id = None;
                    job.job_id = None;
                    job.volumes.clear();
                }
                placed_here
            })
            .unwrap_or(false);
        if reset {
            self.retry_request(request, error.to_string());
        }
    }

    /// Re-queue a failed request after the retry delay, or give up once
    /// the attempt budget is spent.
    fn retry_request(&mut self, request: JobRequest, error: String) {
        let attempt = request.attempt + 1;
        if attempt >= self.config.placement_attempts {
            error!(job = %request.job, attempts = attempt, %error, "giving up placing job");
            self.mark_stopped(&request.job, StopReason::Cancelled);
            if let Some(job) = self.jobs.get(&request.job).cloned() {
                self.publish(Event::JobRequest {
                    job,
                    attempt,
                    delay: Duration::ZERO,
                    error: Some(error),
                });
            }
            return;
        }

        let delay = self.config.placement_retry_delay;
        warn!(job = %request.job, attempt, ?delay, %error, "placement failed, retrying");
        if let Some(job) = self.jobs.get(&request.job).cloned() {
            self.publish(Event::JobRequest {
                job,
                attempt,
                delay,
                error: Some(error),
            });
        }
        let tx = self.outlets.requests.clone();
        let retry = JobRequest {
            job: request.job,
            attempt,
        };
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(retry).await;
        });
        if let Some(stale) = self.retry_timers.insert(request.job, timer) {
            stale.abort();
        }
    }

    pub(super) fn retry_due(&mut self, request: JobRequest) {
        self.retry_timers.remove(&request.job);
        self.process_request(request);
    }

    /// Create a job for a formation type and queue it for placement.
    pub(super) fn request_job(&mut self, job: Job) {
        let id = job.id;
        debug!(job = %id, job_type = %job.job_type, "requesting job");
        self.jobs.insert(job.clone());
        self.publish(Event::JobRequest {
            job,
            attempt: 0,
            delay: Duration::ZERO,
            error: None,
        });
        self.queued.push_back(JobRequest::new(id));
    }

    // ── Restarts ────────────────────────────────────────────────────

    /// Replace a crashed job after its back-off delay, if the formation
    /// resurrects the type and still wants another job of it.
    fn maybe_restart(&mut self, crashed: &Job) {
        let Some(formation) = crashed.formation.as_ref().and_then(|key| self.formations.get(key)) else {
            return;
        };
        let resurrect = formation
            .process(&crashed.job_type)
            .is_some_and(|p| p.resurrect);
        if !resurrect {
            debug!(job = %crashed.id, job_type = %crashed.job_type, "type does not resurrect, not restarting");
            return;
        }
        let desired = desired_count(formation, &crashed.job_type, &self.hosts);
        let actual = self.jobs.active_count(&formation.key, &crashed.job_type);
        if desired <= actual {
            debug!(job = %crashed.id, desired, actual, "formation satisfied, not restarting");
            return;
        }

        let plan = plan_restart(self.config.backoff_period, crashed, now());
        let mut replacement = Job::new(formation, &crashed.job_type, plan.restarts);
        let id = replacement.id;
        info!(
            job = %crashed.id,
            replacement = %id,
            restarts = plan.restarts,
            delay = ?plan.delay,
            "scheduling job restart"
        );

        if plan.delay.is_zero() {
            self.request_job(replacement);
            return;
        }
        replacement.state = JobState::Scheduled;
        self.jobs.insert(replacement.clone());
        self.publish(Event::JobRequest {
            job: replacement,
            attempt: 0,
            delay: plan.delay,
            error: None,
        });

        let tx = self.outlets.completions.clone();
        let delay = plan.delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Completion::RestartDue(id)).await;
        });
        self.restart_timers.insert(id, timer);
    }

    pub(super) fn restart_due(&mut self, id: Uuid) {
        self.restart_timers.remove(&id);
        let due = self
            .jobs
            .update(&id, |job| {
                let scheduled = job.state == JobState::Scheduled;
                if scheduled {
                    job.state = JobState::New;
                }
                scheduled
            })
            .unwrap_or(false);
        if due {
            debug!(job = %id, "restart delay elapsed");
            self.queued.push_back(JobRequest::new(id));
        }
    }

    // ── Stops ───────────────────────────────────────────────────────

    /// Stop a job. Jobs not yet on a host are cancelled outright.
    pub(super) fn stop_job(&mut self, id: Uuid) {
        let Some(state) = self.jobs.get(&id).map(|job| job.state) else {
            return;
        };
        match state {
            JobState::New | JobState::Scheduled => {
                let timers = [self.restart_timers.remove(&id), self.retry_timers.remove(&id)];
                for timer in timers.into_iter().flatten() {
                    timer.abort();
                }
                self.mark_stopped(&id, StopReason::Cancelled);
            }
            JobState::Pending | JobState::Starting | JobState::Running => {
                self.jobs.update(&id, |job| job.state = JobState::Stopping);
                info!(job = %id, from = %state, "stopping job");
                self.send_stop(id);
            }
            JobState::Stopping => self.send_stop(id),
            JobState::Stopped => {}
        }
    }

    /// Ask the job's host to stop it.
    pub(super) fn send_stop(&self, id: Uuid) {
        let Some(job) = self.jobs.get(&id) else {
            return;
        };
        if let (Some(host_id), Some(job_id)) = (&job.host_id, &job.job_id) {
            self.stop_on_host(host_id, job_id);
        }
    }

    fn stop_on_host(&self, host_id: &str, job_id: &str) {
        if !self.is_leader() {
            return;
        }
        let Some(client) = self.hosts.get(host_id).map(|host| host.client()) else {
            return;
        };
        let timeout = self.config.rpc_timeout;
        let host_id = host_id.to_string();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = with_timeout(timeout, client.stop_job(&job_id)).await {
                warn!(%host_id, %job_id, error = %e, "failed to stop job");
            }
        });
    }

    /// Move a job to `Stopped` without hearing from its host.
    pub(super) fn mark_stopped(&mut self, id: &Uuid, reason: StopReason) {
        let now = now();
        let changed = self
            .jobs
            .update(id, |job| {
                if job.state == JobState::Stopped {
                    return false;
                }
                job.state = JobState::Stopped;
                job.stop_reason = Some(reason);
                job.stopped_at = Some(now);
                true
            })
            .unwrap_or(false);
        if !changed {
            return;
        }
        self.persist(id);
        if let Some(job) = self.jobs.get(id).cloned() {
            debug!(job = %id, ?reason, "job marked stopped");
            if let Some(job_id) = &job.job_id {
                self.services.forget(job_id);
            }
            self.publish(Event::JobStop { job });
        }
    }

    /// A job vanished with its host or from its host's listing.
    pub(super) fn job_lost(&mut self, id: Uuid) {
        let Some(job) = self.jobs.get(&id) else {
            return;
        };
        let reason = if job.state == JobState::Stopping {
            StopReason::Requested
        } else {
            StopReason::Lost
        };
        let formation = job.formation.clone();
        warn!(job = %id, host_id = ?job.host_id, ?reason, "job lost");
        self.mark_stopped(&id, reason);
        if let Some(key) = formation {
            self.trigger_rectify(key);
        }
    }
}

/// Provision the job's volume if it needs one, then add it to the host.
async fn start_job(
    client: Arc<dyn HostClient>,
    mut config: JobConfig,
    needs_volume: bool,
    timeout: Duration,
    request: JobRequest,
    host_id: HostId,
) -> Completion {
    if needs_volume {
        match with_timeout(timeout, client.provision_volume(&config)).await {
            Ok(volume) => config.volumes.push(volume),
            Err(error) => {
                return Completion::StartFailed {
                    request,
                    host_id,
                    error,
                };
            }
        }
    }
    match with_timeout(timeout, client.add_job(&config)).await {
        Ok(()) => Completion::JobStarted {
            job: request.job,
            volumes: config.volumes,
        },
        Err(error) => Completion::StartFailed {
            request,
            host_id,
            error,
        },
    }
}

/// Monotonic start time from the host's wall-clock report.
fn reported_start(reported: Option<DateTime<Utc>>, now: std::time::Instant) -> std::time::Instant {
    let age = reported
        .and_then(|at| (Utc::now() - at).to_std().ok())
        .unwrap_or_default();
    now.checked_sub(age).unwrap_or(now)
}
