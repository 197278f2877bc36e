//! Scenario file parser.
//!
//! A scenario describes the simulated cluster a scheduler runs against:
//! hosts, formations, scheduler overrides and a timeline of steps that
//! mutate the cluster while the scheduler runs.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use convoy_scheduler::{SchedulerConfig, parse_duration};
use convoy_sim::FormationBuilder;
use convoy_state::{ExpandedFormation, FormationKey, ProcessType, Tags};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub scheduler: SchedulerOverrides,
    /// Start as leader.
    #[serde(default = "default_true")]
    pub leader: bool,
    #[serde(default)]
    pub hosts: Vec<HostSpec>,
    #[serde(default)]
    pub formations: Vec<FormationSpec>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Scheduler settings; durations use the "10s" / "500ms" form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerOverrides {
    pub backoff_period: Option<String>,
    pub max_host_checks: Option<u32>,
    pub host_check_interval: Option<String>,
    pub placement_attempts: Option<u32>,
    pub placement_retry_delay: Option<String>,
    pub sync_jobs_interval: Option<String>,
    pub sync_formations_interval: Option<String>,
    pub sync_hosts_interval: Option<String>,
    pub startup_timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSpec {
    pub id: String,
    #[serde(default)]
    pub tags: Tags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormationSpec {
    pub app: String,
    pub release: String,
    #[serde(default)]
    pub processes: BTreeMap<String, ProcessSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessSpec {
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub omni: bool,
    #[serde(default)]
    pub resurrect: bool,
    #[serde(default)]
    pub data: bool,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub tags: Tags,
}

/// One timeline entry, applied `after` the previous one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub after: String,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    AddHost {
        id: String,
        #[serde(default)]
        tags: Tags,
    },
    /// Clean shutdown announced through discovery.
    ShutdownHost { id: String },
    /// The host stops answering and disappears from discovery.
    FailHost { id: String },
    /// The host answers again.
    RecoverHost { id: String },
    Scale {
        app: String,
        release: String,
        process: String,
        count: u32,
    },
    /// Crash the first job running on a host.
    CrashJob { host: String },
    SetLeader { is_leader: bool },
}

fn default_true() -> bool {
    true
}

impl Scenario {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading scenario {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let scenario: Scenario = toml::from_str(content)?;
        scenario.validate()?;
        Ok(scenario)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for step in &self.steps {
            duration(&step.after).with_context(|| format!("step {:?}", step.action))?;
        }
        let mut seen = std::collections::HashSet::new();
        for host in &self.hosts {
            if !seen.insert(&host.id) {
                bail!("duplicate host {}", host.id);
            }
        }
        self.scheduler_config(SchedulerConfig::default())?.validate()?;
        Ok(())
    }

    /// Overlay the scenario's scheduler settings on `base`.
    pub fn scheduler_config(&self, base: SchedulerConfig) -> anyhow::Result<SchedulerConfig> {
        let o = &self.scheduler;
        let mut config = base;
        if let Some(v) = &o.backoff_period {
            config.backoff_period = duration(v)?;
        }
        if let Some(v) = o.max_host_checks {
            config.max_host_checks = v;
        }
        if let Some(v) = &o.host_check_interval {
            config.host_check_interval = duration(v)?;
        }
        if let Some(v) = o.placement_attempts {
            config.placement_attempts = v;
        }
        if let Some(v) = &o.placement_retry_delay {
            config.placement_retry_delay = duration(v)?;
        }
        if let Some(v) = &o.sync_jobs_interval {
            config.sync_jobs_interval = duration(v)?;
        }
        if let Some(v) = &o.sync_formations_interval {
            config.sync_formations_interval = duration(v)?;
        }
        if let Some(v) = &o.sync_hosts_interval {
            config.sync_hosts_interval = duration(v)?;
        }
        if let Some(v) = &o.startup_timeout {
            config.startup_timeout = duration(v)?;
        }
        Ok(config)
    }

    /// Discovery service registered by each (formation, type), if any.
    pub fn services(&self) -> BTreeMap<(FormationKey, String), String> {
        self.formations
            .iter()
            .flat_map(|f| {
                let key = FormationKey::new(&f.app, &f.release);
                f.processes.iter().filter_map(move |(name, p)| {
                    p.service
                        .clone()
                        .map(|service| ((key.clone(), name.clone()), service))
                })
            })
            .collect()
    }
}

impl FormationSpec {
    pub fn build(&self) -> ExpandedFormation {
        self.processes
            .iter()
            .fold(FormationBuilder::new(&self.app, &self.release), |builder, (name, p)| {
                let process = ProcessType {
                    omni: p.omni,
                    tags: p.tags.clone(),
                    data: p.data,
                    resurrect: p.resurrect,
                    service: p.service.clone(),
                    ..ProcessType::default()
                };
                builder.process_with(name, p.count, process)
            })
            .build()
    }
}

/// Parse a duration field, naming the bad value on failure.
pub fn duration(raw: &str) -> anyhow::Result<Duration> {
    parse_duration(raw).with_context(|| format!("invalid duration {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_state::Formation;

    const SAMPLE: &str = r#"
leader = true

[scheduler]
backoff_period = "100ms"
max_host_checks = 3

[[hosts]]
id = "host1"
tags = { disk = "ssd" }

[[hosts]]
id = "host2"

[[formations]]
app = "blog"
release = "v1"

[formations.processes.web]
count = 2
resurrect = true
service = "blog-web"

[formations.processes.agent]
count = 1
omni = true

[[steps]]
after = "1s"
action = "crash_job"
host = "host1"

[[steps]]
after = "500ms"
action = "scale"
app = "blog"
release = "v1"
process = "web"
count = 4
"#;

    #[test]
    fn parses_sample_scenario() {
        let scenario = Scenario::parse(SAMPLE).unwrap();
        assert_eq!(scenario.hosts.len(), 2);
        assert_eq!(scenario.hosts[0].tags.get("disk").unwrap(), "ssd");
        assert_eq!(scenario.steps.len(), 2);
        assert_eq!(
            scenario.steps[0].action,
            Action::CrashJob {
                host: "host1".to_string()
            }
        );

        let formation = scenario.formations[0].build();
        assert_eq!(formation.processes.get("web"), Some(&2));
        assert!(formation.release.processes["agent"].omni);
        assert!(formation.release.processes["web"].resurrect);
    }

    #[test]
    fn overrides_apply_on_top_of_base() {
        let scenario = Scenario::parse(SAMPLE).unwrap();
        let config = scenario.scheduler_config(SchedulerConfig::default()).unwrap();
        assert_eq!(config.backoff_period, Duration::from_millis(100));
        assert_eq!(config.max_host_checks, 3);
        assert_eq!(config.placement_attempts, SchedulerConfig::default().placement_attempts);
    }

    #[test]
    fn services_are_keyed_by_formation_and_type() {
        let scenario = Scenario::parse(SAMPLE).unwrap();
        let services = scenario.services();
        assert_eq!(
            services.get(&(FormationKey::new("blog", "v1"), "web".to_string())),
            Some(&"blog-web".to_string())
        );
        assert_eq!(services.len(), 1);
    }

    #[test]
    fn bundled_scenario_is_valid() {
        let scenario = Scenario::parse(include_str!("../scenarios/basic.toml")).unwrap();
        assert_eq!(scenario.steps.len(), 5);
        assert!(matches!(scenario.steps[2].action, Action::FailHost { .. }));
        let formation = Formation::from_expanded(scenario.formations[0].build());
        assert_eq!(formation.required_tags("db").get("disk").map(String::as_str), Some("ssd"));
    }

    #[test]
    fn rejects_bad_durations_and_duplicate_hosts() {
        assert!(Scenario::parse("[[steps]]\nafter = \"soon\"\naction = \"set_leader\"\nis_leader = false\n").is_err());
        assert!(Scenario::parse("[[hosts]]\nid = \"a\"\n[[hosts]]\nid = \"a\"\n").is_err());
        assert!(Scenario::parse("[scheduler]\nbackoff_period = \"ten\"\n").is_err());
    }
}
