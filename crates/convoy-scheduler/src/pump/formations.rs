//! Formation updates, lookups, sync and reconciliation.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use convoy_cluster::{ClientError, ClientResult, with_timeout};
use convoy_state::{ExpandedFormation, FormationKey, Job};

use super::{Completion, Pump};
use crate::events::Event;
use crate::reconcile;
use crate::streams::fire_after;

impl Pump {
    pub(super) fn apply_formation(&mut self, ef: ExpandedFormation) {
        let key = ef.key();
        let updated_at = ef.updated_at;
        self.outlets.watermark.send_if_modified(|watermark| {
            if watermark.is_none_or(|seen| updated_at > seen) {
                *watermark = Some(updated_at);
                true
            } else {
                false
            }
        });
        self.formation_lookups.remove(&key);

        let change = self.formations.apply(ef);
        if !change.is_effective() {
            trace!(formation = %key, ?change, "formation unchanged");
            return;
        }

        for id in self.jobs.formationless(&key) {
            self.jobs.update(&id, |job| job.formation = Some(key.clone()));
        }
        if let Some(formation) = self.formations.get(&key).cloned() {
            info!(formation = %key, processes = ?formation.processes, ?change, "formation changed");
            self.watch_services(&formation);
        }
        self.publish(Event::FormationChange {
            formation: key.clone(),
        });
        self.trigger_rectify(key);
    }

    /// Fetch a formation the scheduler has jobs for but has not seen.
    pub(super) fn lookup_formation(&mut self, key: FormationKey) {
        if self.formations.contains(&key) || !self.formation_lookups.insert(key.clone()) {
            return;
        }
        debug!(formation = %key, "looking up formation");
        let controller = self.controller.clone();
        let timeout = self.config.rpc_timeout;
        self.complete(async move {
            let result = with_timeout(timeout, controller.get_formation(&key.app_id, &key.release_id)).await;
            Completion::FormationFetched { key, result }
        });
    }

    pub(super) fn formation_fetched(&mut self, key: FormationKey, result: ClientResult<ExpandedFormation>) {
        match result {
            Ok(ef) => self.apply_formation(ef),
            Err(e) => {
                warn!(formation = %key, error = %e, "failed to look up formation");
                self.formation_lookups.remove(&key);
            }
        }
    }

    // ── Formation sync ──────────────────────────────────────────────

    pub(super) fn sync_formations(&mut self) {
        debug!("syncing formations");
        let controller = self.controller.clone();
        let timeout = self.config.rpc_timeout;
        let requested_at = Utc::now();
        self.complete(async move {
            let result = async {
                let mut formations = Vec::new();
                for app in with_timeout(timeout, controller.app_list()).await? {
                    formations.extend(with_timeout(timeout, controller.formation_list(&app.id)).await?);
                }
                Ok::<_, ClientError>(formations)
            }
            .await;
            Completion::FormationsListed { requested_at, result }
        });
    }

    pub(super) fn formations_listed(
        &mut self,
        requested_at: DateTime<Utc>,
        result: ClientResult<Vec<ExpandedFormation>>,
    ) {
        let listed = match result {
            Ok(listed) => listed,
            Err(e) => {
                warn!(error = %e, "formation sync failed");
                self.publish(Event::FormationSync {
                    error: Some(e.to_string()),
                });
                fire_after(
                    self.outlets.triggers.sync_formations.clone(),
                    self.config.sync_retry_delay,
                );
                return;
            }
        };

        let keys: HashSet<FormationKey> = listed.iter().map(ExpandedFormation::key).collect();
        for ef in listed {
            self.apply_formation(ef);
        }

        // Formations the controller no longer lists are scaled to zero,
        // unless they arrived after the listing was taken.
        let removed: Vec<FormationKey> = self
            .formations
            .iter()
            .filter(|f| !keys.contains(&f.key) && f.updated_at < requested_at)
            .map(|f| f.key.clone())
            .collect();
        for key in removed {
            if self.formations.scale_to_zero(&key) {
                info!(formation = %key, "formation removed, scaling to zero");
                self.publish(Event::FormationChange {
                    formation: key.clone(),
                });
                self.trigger_rectify(key);
            }
        }
        self.rectify_all();
        self.publish(Event::FormationSync { error: None });
    }

    // ── Reconciliation ──────────────────────────────────────────────

    pub(super) fn rectify_pending(&mut self) {
        let keys = std::mem::take(&mut self.rectify_keys);
        for key in keys {
            self.rectify(&key);
        }
    }

    fn rectify(&mut self, key: &FormationKey) {
        if !self.is_leader() {
            return;
        }
        let Some(formation) = self.formations.get(key) else {
            return;
        };
        let plan = reconcile::plan(formation, &self.jobs, &self.hosts);
        let formation = formation.clone();
        self.publish(Event::Rectify {
            formation: key.clone(),
        });
        if plan.is_empty() {
            trace!(formation = %key, "formation satisfied");
            return;
        }

        info!(
            formation = %key,
            starts = plan.starts.len(),
            stops = plan.stops.len(),
            "reconciling formation"
        );
        for job_type in &plan.starts {
            self.request_job(Job::new(&formation, job_type, 0));
        }
        for id in plan.stops {
            self.stop_job(id);
        }
    }
}
