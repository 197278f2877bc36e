//! Domain types for the Convoy scheduler.
//!
//! These types describe formations (what should run), jobs (what the
//! scheduler believes is running), and the records exchanged with the
//! controller, the cluster and individual hosts. Wire types serialize to
//! JSON; the in-memory `Job` carries monotonic timestamps and does not.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StateError, StateResult};

/// Identifier of an application.
pub type AppId = String;

/// Identifier of an immutable release.
pub type ReleaseId = String;

/// Identifier of a container host.
pub type HostId = String;

/// Host tags and tag predicates (key → value).
pub type Tags = BTreeMap<String, String>;

/// Metadata key prefix marking a host tag in discovery instance metadata.
pub const HOST_TAG_PREFIX: &str = "tag:";

/// Discovery metadata key set on hosts that are shutting down.
pub const META_SHUTDOWN: &str = "shutdown";

/// Discovery metadata key carrying the cluster job id of a service instance.
pub const META_JOB_ID: &str = "FLYNN_JOB_ID";

// ── Formation ─────────────────────────────────────────────────────

/// Key of a formation: one release of one application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FormationKey {
    pub app_id: AppId,
    pub release_id: ReleaseId,
}

impl FormationKey {
    pub fn new(app_id: impl Into<AppId>, release_id: impl Into<ReleaseId>) -> Self {
        Self {
            app_id: app_id.into(),
            release_id: release_id.into(),
        }
    }

    /// Parse the `app:release` form written into job metadata.
    pub fn parse(s: &str) -> StateResult<Self> {
        match s.split_once(':') {
            Some((app, release)) if !app.is_empty() && !release.is_empty() => {
                Ok(Self::new(app, release))
            }
            _ => Err(StateError::InvalidFormationKey(s.to_string())),
        }
    }
}

impl fmt::Display for FormationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.app_id, self.release_id)
    }
}

/// Application metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct App {
    pub id: AppId,
    pub name: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// Specification of one process type within a release.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessType {
    /// Desired count is per matching host rather than cluster-wide.
    #[serde(default)]
    pub omni: bool,
    /// Required host tags. An empty value matches any value.
    #[serde(default)]
    pub tags: Tags,
    /// Jobs of this type need a data volume provisioned before start.
    #[serde(default)]
    pub data: bool,
    /// Restart jobs of this type when they crash.
    #[serde(default)]
    pub resurrect: bool,
    /// Discovery service the job registers once it is ready.
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Passed through to the host untouched.
    #[serde(default)]
    pub resources: serde_json::Value,
}

/// An immutable release of an application.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Release {
    pub id: ReleaseId,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub processes: BTreeMap<String, ProcessType>,
}

/// A formation as streamed by the controller, with app and release inlined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpandedFormation {
    pub app: App,
    pub release: Release,
    /// Desired count per process type.
    #[serde(default)]
    pub processes: BTreeMap<String, u32>,
    /// Extra required host tags per process type.
    #[serde(default)]
    pub tags: BTreeMap<String, Tags>,
    pub updated_at: DateTime<Utc>,
}

impl ExpandedFormation {
    pub fn key(&self) -> FormationKey {
        FormationKey::new(&self.app.id, &self.release.id)
    }
}

/// Item of the controller's formation stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FormationUpdate {
    Formation(ExpandedFormation),
    /// The initial snapshot has been fully delivered.
    Current,
}

/// In-memory formation held in the formation table.
#[derive(Debug, Clone, PartialEq)]
pub struct Formation {
    pub key: FormationKey,
    pub app: App,
    pub release: Release,
    pub processes: BTreeMap<String, u32>,
    pub tags: BTreeMap<String, Tags>,
    pub updated_at: DateTime<Utc>,
}

impl Formation {
    pub fn from_expanded(ef: ExpandedFormation) -> Self {
        Self {
            key: ef.key(),
            app: ef.app,
            release: ef.release,
            processes: ef.processes,
            tags: ef.tags,
            updated_at: ef.updated_at,
        }
    }

    /// Process type spec, if the release defines it.
    pub fn process(&self, job_type: &str) -> Option<&ProcessType> {
        self.release.processes.get(job_type)
    }

    /// Configured count for a type (before omni expansion).
    pub fn desired(&self, job_type: &str) -> u32 {
        self.processes.get(job_type).copied().unwrap_or(0)
    }

    /// Required host tags for a type: the release's process tags
    /// overlaid with the formation's per-type tags.
    pub fn required_tags(&self, job_type: &str) -> Tags {
        let mut tags = self
            .process(job_type)
            .map(|p| p.tags.clone())
            .unwrap_or_default();
        if let Some(extra) = self.tags.get(job_type) {
            tags.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        tags
    }

    /// Whether jobs of this type can be started from this formation.
    pub fn is_schedulable(&self, job_type: &str) -> bool {
        self.process(job_type).is_some()
    }

    pub fn is_omni(&self, job_type: &str) -> bool {
        self.process(job_type).is_some_and(|p| p.omni)
    }

    /// Whether every desired count is zero.
    pub fn is_empty(&self) -> bool {
        self.processes.values().all(|&n| n == 0)
    }

    /// Whether an incoming formation would change what this one asks for.
    pub fn differs_from(&self, ef: &ExpandedFormation) -> bool {
        self.processes != ef.processes || self.tags != ef.tags || self.release != ef.release
    }
}

// ── Job ───────────────────────────────────────────────────────────

/// Scheduler-side lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Requested, waiting for a placement decision.
    New,
    /// Placed on a host; `AddJob` dispatched.
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Replacement waiting on a restart timer.
    Scheduled,
}

impl JobState {
    /// Whether the job counts towards a formation's actual count.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Stopping | Self::Stopped)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Scheduled => "scheduled",
        };
        f.write_str(s)
    }
}

/// Why a job reached `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The scheduler asked the host to stop it.
    Requested,
    /// Cancelled before it reached a host (new or scheduled).
    Cancelled,
    /// Exited on its own.
    Exited,
    Crashed,
    Failed,
    /// Its host was unfollowed or no longer lists it.
    Lost,
}

impl StopReason {
    /// Terminations the restart policy reacts to.
    pub fn is_crash(self) -> bool {
        matches!(self, Self::Exited | Self::Crashed | Self::Failed)
    }

    pub fn persisted_state(self) -> PersistedJobState {
        match self {
            Self::Crashed => PersistedJobState::Crashed,
            Self::Failed => PersistedJobState::Failed,
            _ => PersistedJobState::Down,
        }
    }
}

/// A job as tracked by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Scheduler-assigned id, stable for the job's lifetime.
    pub id: Uuid,
    /// Cluster job id, assigned at placement.
    pub job_id: Option<String>,
    pub host_id: Option<HostId>,
    pub job_type: String,
    pub app_id: AppId,
    pub release_id: ReleaseId,
    /// `None` until the formation is known.
    pub formation: Option<FormationKey>,
    pub state: JobState,
    pub restarts: u32,
    pub started_at: Option<Instant>,
    pub stopped_at: Option<Instant>,
    pub stop_reason: Option<StopReason>,
    pub volumes: Vec<String>,
    pub exit_status: Option<i32>,
    pub host_error: Option<String>,
    pub metadata: JobMetadata,
}

impl Job {
    /// A fresh job for a formation type, waiting for placement.
    pub fn new(formation: &Formation, job_type: &str, restarts: u32) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            job_id: None,
            host_id: None,
            job_type: job_type.to_string(),
            app_id: formation.key.app_id.clone(),
            release_id: formation.key.release_id.clone(),
            formation: Some(formation.key.clone()),
            state: JobState::New,
            restarts,
            started_at: None,
            stopped_at: None,
            stop_reason: None,
            volumes: Vec::new(),
            exit_status: None,
            host_error: None,
            metadata: JobMetadata::for_formation(formation, job_type, id),
        }
    }

    /// A job first seen in a host report.
    pub fn discovered(host_id: &str, job_id: &str, metadata: JobMetadata) -> Self {
        Self {
            id: metadata.scheduler_id,
            job_id: Some(job_id.to_string()),
            host_id: Some(host_id.to_string()),
            job_type: metadata.job_type.clone(),
            app_id: metadata.app_id.clone(),
            release_id: metadata.release_id.clone(),
            formation: None,
            state: JobState::New,
            restarts: 0,
            started_at: None,
            stopped_at: None,
            stop_reason: None,
            volumes: Vec::new(),
            exit_status: None,
            host_error: None,
            metadata,
        }
    }

    pub fn formation_key(&self) -> FormationKey {
        FormationKey::new(&self.app_id, &self.release_id)
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Build the controller record for the job's current state, if that
    /// state is visible outside the scheduler.
    pub fn to_controller(&self) -> Option<ControllerJob> {
        let state = match self.state {
            JobState::Starting => PersistedJobState::Starting,
            JobState::Running => PersistedJobState::Up,
            JobState::Stopped => self
                .stop_reason
                .map_or(PersistedJobState::Down, StopReason::persisted_state),
            _ => return None,
        };
        Some(ControllerJob {
            uuid: self.id,
            job_id: self.job_id.clone(),
            host_id: self.host_id.clone(),
            app_id: self.app_id.clone(),
            release_id: self.release_id.clone(),
            job_type: self.job_type.clone(),
            state,
            restarts: self.restarts,
            exit_status: self.exit_status,
            host_error: self.host_error.clone(),
            meta: self.metadata.extra.clone(),
        })
    }
}

// ── Job metadata ──────────────────────────────────────────────────

pub const META_APP: &str = "flynn-controller.app";
pub const META_APP_NAME: &str = "flynn-controller.app_name";
pub const META_RELEASE: &str = "flynn-controller.release";
pub const META_TYPE: &str = "flynn-controller.type";
pub const META_FORMATION: &str = "flynn-controller.formation";
pub const META_SCHEDULER_ID: &str = "flynn-controller.scheduler_id";

/// Typed view of the metadata the scheduler writes into every job.
///
/// Unknown keys are carried in `extra` and written back unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMetadata {
    pub app_id: AppId,
    pub app_name: Option<String>,
    pub release_id: ReleaseId,
    pub job_type: String,
    pub formation: Option<FormationKey>,
    pub scheduler_id: Uuid,
    pub extra: BTreeMap<String, String>,
}

impl JobMetadata {
    pub fn for_formation(formation: &Formation, job_type: &str, scheduler_id: Uuid) -> Self {
        Self {
            app_id: formation.key.app_id.clone(),
            app_name: Some(formation.app.name.clone()),
            release_id: formation.key.release_id.clone(),
            job_type: job_type.to_string(),
            formation: Some(formation.key.clone()),
            scheduler_id,
            extra: BTreeMap::new(),
        }
    }

    /// Decode the metadata map reported by a host.
    ///
    /// Fails when any key needed to reconstruct ownership is missing or
    /// malformed; such jobs were not started by this scheduler.
    pub fn decode(map: &BTreeMap<String, String>) -> StateResult<Self> {
        let required = |key: &'static str| {
            map.get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or(StateError::MissingMetadata(key))
        };

        let raw_id = required(META_SCHEDULER_ID)?;
        let scheduler_id =
            Uuid::parse_str(&raw_id).map_err(|_| StateError::InvalidSchedulerId(raw_id))?;
        let formation = match map.get(META_FORMATION) {
            Some(s) => Some(FormationKey::parse(s)?),
            None => None,
        };

        let extra = map
            .iter()
            .filter(|(k, _)| !is_reserved_key(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            app_id: required(META_APP)?,
            app_name: map.get(META_APP_NAME).cloned(),
            release_id: required(META_RELEASE)?,
            job_type: required(META_TYPE)?,
            formation,
            scheduler_id,
            extra,
        })
    }

    /// Encode into the flat map sent with `AddJob`.
    pub fn encode(&self) -> BTreeMap<String, String> {
        let mut map = self.extra.clone();
        map.insert(META_APP.to_string(), self.app_id.clone());
        if let Some(name) = &self.app_name {
            map.insert(META_APP_NAME.to_string(), name.clone());
        }
        map.insert(META_RELEASE.to_string(), self.release_id.clone());
        map.insert(META_TYPE.to_string(), self.job_type.clone());
        if let Some(key) = &self.formation {
            map.insert(META_FORMATION.to_string(), key.to_string());
        }
        map.insert(META_SCHEDULER_ID.to_string(), self.scheduler_id.to_string());
        map
    }
}

fn is_reserved_key(key: &str) -> bool {
    matches!(
        key,
        META_APP | META_APP_NAME | META_RELEASE | META_TYPE | META_FORMATION | META_SCHEDULER_ID
    )
}

// ── Host wire types ───────────────────────────────────────────────

/// Job status as reported by a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostJobStatus {
    Starting,
    Running,
    Done,
    Crashed,
    Failed,
}

impl HostJobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Crashed | Self::Failed)
    }

    pub fn stop_reason(self) -> Option<StopReason> {
        match self {
            Self::Done => Some(StopReason::Exited),
            Self::Crashed => Some(StopReason::Crashed),
            Self::Failed => Some(StopReason::Failed),
            Self::Starting | Self::Running => None,
        }
    }
}

/// A job record as held by a host; also the payload of its event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveJob {
    pub job_id: String,
    pub status: HostJobStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_status: Option<i32>,
    #[serde(default)]
    pub host_error: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Where a host job record entered the scheduler from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEventSource {
    /// Synthetic event built from a `ListJobs` snapshot.
    Snapshot,
    Stream,
}

/// A host job record tagged with the host that reported it.
#[derive(Debug, Clone, PartialEq)]
pub struct HostJobEvent {
    pub host_id: HostId,
    pub job: ActiveJob,
    pub source: JobEventSource,
}

/// Payload of `AddJob` and `ProvisionVolume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_id: String,
    pub artifacts: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub resources: serde_json::Value,
    pub metadata: BTreeMap<String, String>,
    pub volumes: Vec<String>,
    pub service: Option<String>,
}

impl JobConfig {
    /// Build the host job config for a placed job of a formation.
    pub fn for_job(job: &Job, formation: &Formation) -> Option<Self> {
        let process = formation.process(&job.job_type)?;
        let job_id = job.job_id.clone()?;
        let mut env = formation.release.env.clone();
        env.extend(process.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        Some(Self {
            job_id,
            artifacts: formation.release.artifacts.clone(),
            args: process.args.clone(),
            env,
            resources: process.resources.clone(),
            metadata: job.metadata.encode(),
            volumes: job.volumes.clone(),
            service: process.service.clone(),
        })
    }
}

/// Reply of a host liveness check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStatus {
    pub host_id: HostId,
    #[serde(default)]
    pub tags: Tags,
}

// ── Discovery ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryEventKind {
    Up,
    Down,
    Update,
    /// The initial snapshot has been fully delivered.
    Current,
}

/// A registered service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl Instance {
    /// Host tags carried in the instance metadata.
    pub fn host_tags(&self) -> Tags {
        self.meta
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(HOST_TAG_PREFIX)
                    .map(|tag| (tag.to_string(), v.clone()))
            })
            .collect()
    }

    pub fn is_shutdown(&self) -> bool {
        self.meta.get(META_SHUTDOWN).is_some_and(|v| v == "true")
    }

    /// Cluster job id of the job backing this service instance.
    pub fn job_id(&self) -> Option<&str> {
        self.meta.get(META_JOB_ID).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryEvent {
    pub kind: DiscoveryEventKind,
    #[serde(default)]
    pub instance: Option<Instance>,
}

impl DiscoveryEvent {
    pub fn new(kind: DiscoveryEventKind, instance: Instance) -> Self {
        Self {
            kind,
            instance: Some(instance),
        }
    }

    pub fn current() -> Self {
        Self {
            kind: DiscoveryEventKind::Current,
            instance: None,
        }
    }
}

// ── Controller ────────────────────────────────────────────────────

/// Job state as recorded by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistedJobState {
    Starting,
    Up,
    Down,
    Crashed,
    Failed,
}

/// Job record written to the controller with `PutJob`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerJob {
    pub uuid: Uuid,
    pub job_id: Option<String>,
    pub host_id: Option<HostId>,
    pub app_id: AppId,
    pub release_id: ReleaseId,
    pub job_type: String,
    pub state: PersistedJobState,
    pub restarts: u32,
    pub exit_status: Option<i32>,
    pub host_error: Option<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_formation() -> Formation {
        let mut processes = BTreeMap::new();
        processes.insert(
            "web".to_string(),
            ProcessType {
                tags: Tags::from([("disk".to_string(), "ssd".to_string())]),
                env: BTreeMap::from([("PORT".to_string(), "8080".to_string())]),
                ..ProcessType::default()
            },
        );
        Formation::from_expanded(ExpandedFormation {
            app: App {
                id: "app-1".to_string(),
                name: "blog".to_string(),
                meta: BTreeMap::new(),
            },
            release: Release {
                id: "rel-1".to_string(),
                artifacts: vec!["registry/blog:1".to_string()],
                env: BTreeMap::from([("RACK_ENV".to_string(), "production".to_string())]),
                processes,
            },
            processes: BTreeMap::from([("web".to_string(), 2)]),
            tags: BTreeMap::from([(
                "web".to_string(),
                Tags::from([("zone".to_string(), "a".to_string())]),
            )]),
            updated_at: Utc::now(),
        })
    }

    #[test]
    fn formation_key_display_and_parse() {
        let key = FormationKey::new("app-1", "rel-1");
        assert_eq!(key.to_string(), "app-1:rel-1");
        assert_eq!(FormationKey::parse("app-1:rel-1").unwrap(), key);
        assert!(FormationKey::parse("app-1").is_err());
        assert!(FormationKey::parse(":rel-1").is_err());
    }

    #[test]
    fn required_tags_merge_formation_overrides() {
        let formation = test_formation();
        let tags = formation.required_tags("web");
        assert_eq!(tags.get("disk").unwrap(), "ssd");
        assert_eq!(tags.get("zone").unwrap(), "a");
        assert!(formation.required_tags("worker").is_empty());
    }

    #[test]
    fn new_job_carries_formation_metadata() {
        let formation = test_formation();
        let job = Job::new(&formation, "web", 2);
        assert_eq!(job.state, JobState::New);
        assert_eq!(job.restarts, 2);
        assert_eq!(job.formation, Some(formation.key.clone()));
        assert_eq!(job.metadata.scheduler_id, job.id);
        assert_eq!(job.metadata.app_name.as_deref(), Some("blog"));
    }

    #[test]
    fn metadata_encode_decode_preserves_extra() {
        let formation = test_formation();
        let mut meta = JobMetadata::for_formation(&formation, "web", Uuid::new_v4());
        meta.extra.insert("owner".to_string(), "ops".to_string());

        let map = meta.encode();
        assert_eq!(map.get(META_FORMATION).unwrap(), "app-1:rel-1");
        assert_eq!(map.get(META_TYPE).unwrap(), "web");

        let decoded = JobMetadata::decode(&map).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn metadata_decode_rejects_missing_scheduler_id() {
        let map = BTreeMap::from([
            (META_APP.to_string(), "app-1".to_string()),
            (META_RELEASE.to_string(), "rel-1".to_string()),
            (META_TYPE.to_string(), "web".to_string()),
        ]);
        assert!(matches!(
            JobMetadata::decode(&map),
            Err(StateError::MissingMetadata(META_SCHEDULER_ID))
        ));
    }

    #[test]
    fn metadata_decode_rejects_bad_uuid() {
        let map = BTreeMap::from([
            (META_APP.to_string(), "app-1".to_string()),
            (META_RELEASE.to_string(), "rel-1".to_string()),
            (META_TYPE.to_string(), "web".to_string()),
            (META_SCHEDULER_ID.to_string(), "not-a-uuid".to_string()),
        ]);
        assert!(matches!(
            JobMetadata::decode(&map),
            Err(StateError::InvalidSchedulerId(_))
        ));
    }

    #[test]
    fn job_config_merges_env() {
        let formation = test_formation();
        let mut job = Job::new(&formation, "web", 0);
        assert!(JobConfig::for_job(&job, &formation).is_none());

        job.job_id = Some(format!("host1-{}", job.id));
        let config = JobConfig::for_job(&job, &formation).unwrap();
        assert_eq!(config.env.get("RACK_ENV").unwrap(), "production");
        assert_eq!(config.env.get("PORT").unwrap(), "8080");
        assert_eq!(config.artifacts, vec!["registry/blog:1".to_string()]);
        assert_eq!(
            config.metadata.get(META_SCHEDULER_ID).unwrap(),
            &job.id.to_string()
        );
    }

    #[test]
    fn controller_state_mapping() {
        let formation = test_formation();
        let mut job = Job::new(&formation, "web", 0);
        assert!(job.to_controller().is_none());

        job.state = JobState::Running;
        assert_eq!(job.to_controller().unwrap().state, PersistedJobState::Up);

        job.state = JobState::Stopped;
        job.stop_reason = Some(StopReason::Crashed);
        assert_eq!(job.to_controller().unwrap().state, PersistedJobState::Crashed);

        job.stop_reason = Some(StopReason::Lost);
        assert_eq!(job.to_controller().unwrap().state, PersistedJobState::Down);
    }

    #[test]
    fn instance_host_tags_and_shutdown() {
        let instance = Instance {
            id: "host1".to_string(),
            addr: "10.0.0.1:1113".to_string(),
            meta: BTreeMap::from([
                ("tag:disk".to_string(), "ssd".to_string()),
                ("shutdown".to_string(), "true".to_string()),
                ("other".to_string(), "x".to_string()),
            ]),
        };
        assert_eq!(
            instance.host_tags(),
            Tags::from([("disk".to_string(), "ssd".to_string())])
        );
        assert!(instance.is_shutdown());
    }

    #[test]
    fn formation_differs_on_counts() {
        let formation = test_formation();
        let mut ef = ExpandedFormation {
            app: formation.app.clone(),
            release: formation.release.clone(),
            processes: formation.processes.clone(),
            tags: formation.tags.clone(),
            updated_at: Utc::now(),
        };
        assert!(!formation.differs_from(&ef));
        ef.processes.insert("web".to_string(), 5);
        assert!(formation.differs_from(&ef));
    }
}
