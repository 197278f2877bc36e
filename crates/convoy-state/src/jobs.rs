//! Job table: every job the scheduler knows about.
//!
//! Jobs are keyed by their scheduler UUID and indexed by host and by
//! (formation, type). Index maintenance is internal: callers mutate jobs
//! through [`JobTable::update`], which re-indexes afterwards.

use std::collections::{BTreeSet, HashMap};

use uuid::Uuid;

use crate::types::{FormationKey, HostId, Job, JobState};

#[derive(Debug, Default, Clone)]
pub struct JobTable {
    jobs: HashMap<Uuid, Job>,
    by_host: HashMap<HostId, BTreeSet<Uuid>>,
    by_formation: HashMap<FormationKey, HashMap<String, BTreeSet<Uuid>>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job, replacing any job with the same UUID.
    pub fn insert(&mut self, job: Job) -> Option<Job> {
        let old = self.remove(&job.id);
        self.index(&job);
        self.jobs.insert(job.id, job);
        old
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<Job> {
        let job = self.jobs.remove(id)?;
        self.unindex(&job);
        Some(job)
    }

    pub fn get(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.jobs.contains_key(id)
    }

    /// Mutate a job in place and refresh its index entries.
    pub fn update<R>(&mut self, id: &Uuid, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        let job = self.jobs.get_mut(id)?;
        let host_before = job.host_id.clone();
        let formation_before = job.formation.clone();

        let result = f(job);

        if job.host_id != host_before || job.formation != formation_before {
            let snapshot = job.clone();
            let mut stale = snapshot.clone();
            stale.host_id = host_before;
            stale.formation = formation_before;
            self.unindex(&stale);
            self.index(&snapshot);
        }
        Some(result)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs bound to a host.
    pub fn on_host<'a>(&'a self, host_id: &str) -> impl Iterator<Item = &'a Job> + use<'a> {
        self.by_host
            .get(host_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.jobs.get(id))
    }

    /// Jobs bound to a formation, across all types.
    pub fn for_formation<'a>(&'a self, key: &FormationKey) -> impl Iterator<Item = &'a Job> + use<'a> {
        self.by_formation
            .get(key)
            .into_iter()
            .flat_map(|types| types.values().flatten())
            .filter_map(|id| self.jobs.get(id))
    }

    /// Jobs bound to a (formation, type).
    pub fn for_type<'a>(
        &'a self,
        key: &FormationKey,
        job_type: &str,
    ) -> impl Iterator<Item = &'a Job> + use<'a> {
        self.by_formation
            .get(key)
            .and_then(|types| types.get(job_type))
            .into_iter()
            .flatten()
            .filter_map(|id| self.jobs.get(id))
    }

    /// Types that have at least one job bound to the formation.
    pub fn types_for(&self, key: &FormationKey) -> Vec<String> {
        self.by_formation
            .get(key)
            .map(|types| {
                types
                    .iter()
                    .filter(|(_, ids)| !ids.is_empty())
                    .map(|(t, _)| t.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Count of active jobs of a (formation, type).
    pub fn active_count(&self, key: &FormationKey, job_type: &str) -> u32 {
        self.for_type(key, job_type).filter(|j| j.is_active()).count() as u32
    }

    /// Placement load: active jobs of a (formation, type) bound to a host,
    /// not counting jobs waiting on a restart timer.
    pub fn host_load(&self, key: &FormationKey, job_type: &str, host_id: &str) -> u32 {
        self.for_type(key, job_type)
            .filter(|j| {
                j.is_active()
                    && j.state != JobState::Scheduled
                    && j.host_id.as_deref() == Some(host_id)
            })
            .count() as u32
    }

    /// Jobs with no formation that belong to the given key.
    pub fn formationless(&self, key: &FormationKey) -> Vec<Uuid> {
        self.jobs
            .values()
            .filter(|j| j.formation.is_none() && j.app_id == key.app_id && j.release_id == key.release_id)
            .map(|j| j.id)
            .collect()
    }

    /// Jobs currently in the given state.
    pub fn in_state(&self, state: JobState) -> Vec<Uuid> {
        self.jobs
            .values()
            .filter(|j| j.state == state)
            .map(|j| j.id)
            .collect()
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn index(&mut self, job: &Job) {
        if let Some(host) = &job.host_id {
            self.by_host.entry(host.clone()).or_default().insert(job.id);
        }
        if let Some(key) = &job.formation {
            self.by_formation
                .entry(key.clone())
                .or_default()
                .entry(job.job_type.clone())
                .or_default()
                .insert(job.id);
        }
    }

    fn unindex(&mut self, job: &Job) {
        if let Some(host) = &job.host_id {
            if let Some(ids) = self.by_host.get_mut(host) {
                ids.remove(&job.id);
                if ids.is_empty() {
                    self.by_host.remove(host);
                }
            }
        }
        if let Some(key) = &job.formation {
            if let Some(types) = self.by_formation.get_mut(key) {
                if let Some(ids) = types.get_mut(&job.job_type) {
                    ids.remove(&job.id);
                    if ids.is_empty() {
                        types.remove(&job.job_type);
                    }
                }
                if types.is_empty() {
                    self.by_formation.remove(key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{App, ExpandedFormation, Formation, ProcessType, Release};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn test_formation() -> Formation {
        Formation::from_expanded(ExpandedFormation {
            app: App {
                id: "app-1".to_string(),
                name: "blog".to_string(),
                meta: BTreeMap::new(),
            },
            release: Release {
                id: "rel-1".to_string(),
                processes: BTreeMap::from([
                    ("web".to_string(), ProcessType::default()),
                    ("worker".to_string(), ProcessType::default()),
                ]),
                ..Release::default()
            },
            processes: BTreeMap::from([("web".to_string(), 2), ("worker".to_string(), 1)]),
            tags: BTreeMap::new(),
            updated_at: Utc::now(),
        })
    }

    fn placed(formation: &Formation, job_type: &str, host: &str, state: JobState) -> Job {
        let mut job = Job::new(formation, job_type, 0);
        job.host_id = Some(host.to_string());
        job.job_id = Some(format!("{host}-{}", job.id));
        job.state = state;
        job
    }

    #[test]
    fn insert_indexes_by_host_and_type() {
        let f = test_formation();
        let mut table = JobTable::new();
        table.insert(placed(&f, "web", "host1", JobState::Running));
        table.insert(placed(&f, "web", "host2", JobState::Running));
        table.insert(placed(&f, "worker", "host1", JobState::Starting));

        assert_eq!(table.len(), 3);
        assert_eq!(table.on_host("host1").count(), 2);
        assert_eq!(table.for_type(&f.key, "web").count(), 2);
        assert_eq!(table.for_formation(&f.key).count(), 3);

        let mut types = table.types_for(&f.key);
        types.sort();
        assert_eq!(types, vec!["web".to_string(), "worker".to_string()]);
    }

    #[test]
    fn active_count_skips_stopping_and_stopped() {
        let f = test_formation();
        let mut table = JobTable::new();
        table.insert(placed(&f, "web", "host1", JobState::Running));
        table.insert(placed(&f, "web", "host1", JobState::Stopping));
        table.insert(placed(&f, "web", "host1", JobState::Stopped));
        table.insert(Job::new(&f, "web", 0));

        assert_eq!(table.active_count(&f.key, "web"), 2);
    }

    #[test]
    fn host_load_excludes_scheduled_jobs() {
        let f = test_formation();
        let mut table = JobTable::new();
        table.insert(placed(&f, "web", "host1", JobState::Running));
        table.insert(placed(&f, "web", "host1", JobState::Scheduled));
        table.insert(placed(&f, "web", "host2", JobState::Pending));

        assert_eq!(table.host_load(&f.key, "web", "host1"), 1);
        assert_eq!(table.host_load(&f.key, "web", "host2"), 1);
        assert_eq!(table.host_load(&f.key, "web", "host3"), 0);
    }

    #[test]
    fn update_reindexes_host_changes() {
        let f = test_formation();
        let mut table = JobTable::new();
        let job = Job::new(&f, "web", 0);
        let id = job.id;
        table.insert(job);
        assert_eq!(table.on_host("host1").count(), 0);

        table.update(&id, |j| j.host_id = Some("host1".to_string()));
        assert_eq!(table.on_host("host1").count(), 1);

        table.update(&id, |j| j.host_id = None);
        assert_eq!(table.on_host("host1").count(), 0);
        assert!(table.update(&Uuid::new_v4(), |_| ()).is_none());
    }

    #[test]
    fn formationless_jobs_are_found_and_adopted() {
        let f = test_formation();
        let mut table = JobTable::new();
        let mut job = placed(&f, "web", "host1", JobState::Running);
        job.formation = None;
        let id = job.id;
        table.insert(job);

        assert_eq!(table.for_formation(&f.key).count(), 0);
        assert_eq!(table.formationless(&f.key), vec![id]);

        table.update(&id, |j| j.formation = Some(f.key.clone()));
        assert!(table.formationless(&f.key).is_empty());
        assert_eq!(table.for_type(&f.key, "web").count(), 1);
    }

    #[test]
    fn remove_clears_indexes() {
        let f = test_formation();
        let mut table = JobTable::new();
        let job = placed(&f, "web", "host1", JobState::Running);
        let id = job.id;
        table.insert(job);

        assert!(table.remove(&id).is_some());
        assert!(table.is_empty());
        assert_eq!(table.on_host("host1").count(), 0);
        assert!(table.types_for(&f.key).is_empty());
    }
}
