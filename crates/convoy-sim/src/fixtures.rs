//! Builders for formations and tags used by tests and simulations.

use std::collections::BTreeMap;

use chrono::Utc;

use convoy_state::{App, ExpandedFormation, FormationKey, ProcessType, Release, Tags};

/// Builds an [`ExpandedFormation`] one process type at a time.
#[derive(Debug, Clone)]
pub struct FormationBuilder {
    app: App,
    release: Release,
    processes: BTreeMap<String, u32>,
    tags: BTreeMap<String, Tags>,
}

impl FormationBuilder {
    pub fn new(app_id: &str, release_id: &str) -> Self {
        Self {
            app: App {
                id: app_id.to_string(),
                name: app_id.to_string(),
                meta: BTreeMap::new(),
            },
            release: Release {
                id: release_id.to_string(),
                artifacts: vec![format!("https://images.example/{app_id}/{release_id}")],
                ..Release::default()
            },
            processes: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_app_name(mut self, name: &str) -> Self {
        self.app.name = name.to_string();
        self
    }

    /// Add a process type with default settings.
    pub fn process(self, job_type: &str, count: u32) -> Self {
        self.process_with(job_type, count, ProcessType::default())
    }

    pub fn process_with(mut self, job_type: &str, count: u32, process: ProcessType) -> Self {
        self.release.processes.insert(job_type.to_string(), process);
        self.processes.insert(job_type.to_string(), count);
        self
    }

    /// Extra host tags required by one type, on top of its release tags.
    pub fn with_tags(mut self, job_type: &str, tags: Tags) -> Self {
        self.tags.insert(job_type.to_string(), tags);
        self
    }

    pub fn key(&self) -> FormationKey {
        FormationKey::new(&self.app.id, &self.release.id)
    }

    pub fn build(self) -> ExpandedFormation {
        ExpandedFormation {
            app: self.app,
            release: self.release,
            processes: self.processes,
            tags: self.tags,
            updated_at: Utc::now(),
        }
    }
}

/// Tags from `(key, value)` pairs.
pub fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A process type restarted on crash.
pub fn resurrecting() -> ProcessType {
    ProcessType {
        resurrect: true,
        ..ProcessType::default()
    }
}
