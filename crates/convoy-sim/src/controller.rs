//! Simulated controller: formation source and job record sink.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use convoy_cluster::{ClientError, ClientResult, ControllerClient};
use convoy_state::{App, AppId, ControllerJob, ExpandedFormation, FormationKey, FormationUpdate};

use crate::{STREAM_CAPACITY, broadcast, lock};

#[derive(Default)]
struct ControllerState {
    apps: BTreeMap<AppId, App>,
    formations: BTreeMap<FormationKey, ExpandedFormation>,
    subscribers: Vec<mpsc::Sender<FormationUpdate>>,
    puts: Vec<ControllerJob>,
    /// Remaining `put_job` calls to fail.
    failing_puts: u32,
    /// Make `put_job` never answer.
    hanging_puts: bool,
    failing_lists: bool,
    failing_streams: bool,
    /// `since` of every formation stream opened.
    stream_requests: Vec<Option<DateTime<Utc>>>,
}

#[derive(Default)]
pub struct FakeController {
    state: Mutex<ControllerState>,
}

impl FakeController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a formation and stream it to subscribers.
    pub fn set_formation(&self, formation: ExpandedFormation) {
        let mut state = lock(&self.state);
        state
            .apps
            .insert(formation.app.id.clone(), formation.app.clone());
        state.formations.insert(formation.key(), formation.clone());
        broadcast(&mut state.subscribers, FormationUpdate::Formation(formation));
    }

    /// Change one type's desired count, bumping `updated_at`.
    pub fn scale(&self, key: &FormationKey, job_type: &str, count: u32) -> bool {
        let Some(mut formation) = self.formation(key) else {
            return false;
        };
        formation.processes.insert(job_type.to_string(), count);
        formation.updated_at = Utc::now();
        self.set_formation(formation);
        true
    }

    /// Delete a formation without streaming anything, as if the change
    /// was lost; only a formation sync notices.
    pub fn remove_formation(&self, key: &FormationKey) -> Option<ExpandedFormation> {
        lock(&self.state).formations.remove(key)
    }

    pub fn formation(&self, key: &FormationKey) -> Option<ExpandedFormation> {
        lock(&self.state).formations.get(key).cloned()
    }

    /// Make the next `count` job writes fail with a retryable error.
    pub fn fail_puts(&self, count: u32) {
        lock(&self.state).failing_puts = count;
    }

    /// Make every later `put_job` hang until the caller gives up.
    pub fn set_hanging_puts(&self, hanging: bool) {
        lock(&self.state).hanging_puts = hanging;
    }

    /// Make app and formation listings fail.
    pub fn set_failing_lists(&self, failing: bool) {
        lock(&self.state).failing_lists = failing;
    }

    /// Make formation streams fail to open.
    pub fn set_failing_streams(&self, failing: bool) {
        lock(&self.state).failing_streams = failing;
    }

    /// Every job record written, in write order.
    pub fn puts(&self) -> Vec<ControllerJob> {
        lock(&self.state).puts.clone()
    }

    /// Last record written for a job.
    pub fn latest(&self, uuid: Uuid) -> Option<ControllerJob> {
        lock(&self.state)
            .puts
            .iter()
            .rev()
            .find(|job| job.uuid == uuid)
            .cloned()
    }

    /// Last record written for every job.
    pub fn jobs(&self) -> BTreeMap<Uuid, ControllerJob> {
        lock(&self.state)
            .puts
            .iter()
            .map(|job| (job.uuid, job.clone()))
            .collect()
    }

    pub fn stream_requests(&self) -> Vec<Option<DateTime<Utc>>> {
        lock(&self.state).stream_requests.clone()
    }

    /// Close every open formation stream.
    pub fn drop_streams(&self) {
        lock(&self.state).subscribers.clear();
    }

    fn check_lists(state: &ControllerState) -> ClientResult<()> {
        if state.failing_lists {
            Err(ClientError::Unavailable("controller listing failed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ControllerClient for FakeController {
    async fn stream_formations(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> ClientResult<mpsc::Receiver<FormationUpdate>> {
        let mut state = lock(&self.state);
        state.stream_requests.push(since);
        if state.failing_streams {
            return Err(ClientError::Unavailable("formation stream refused".to_string()));
        }
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let snapshot = state
            .formations
            .values()
            .filter(|f| since.is_none_or(|since| f.updated_at >= since));
        for formation in snapshot {
            if tx.try_send(FormationUpdate::Formation(formation.clone())).is_err() {
                return Err(ClientError::Unavailable("formation snapshot too large".to_string()));
            }
        }
        if tx.try_send(FormationUpdate::Current).is_err() {
            return Err(ClientError::Unavailable("formation snapshot too large".to_string()));
        }
        state.subscribers.push(tx);
        Ok(rx)
    }

    async fn get_formation(&self, app_id: &str, release_id: &str) -> ClientResult<ExpandedFormation> {
        let key = FormationKey::new(app_id, release_id);
        self.formation(&key)
            .ok_or_else(|| ClientError::NotFound(format!("formation {key}")))
    }

    async fn app_list(&self) -> ClientResult<Vec<App>> {
        let state = lock(&self.state);
        Self::check_lists(&state)?;
        Ok(state.apps.values().cloned().collect())
    }

    async fn formation_list(&self, app_id: &str) -> ClientResult<Vec<ExpandedFormation>> {
        let state = lock(&self.state);
        Self::check_lists(&state)?;
        Ok(state
            .formations
            .values()
            .filter(|f| f.app.id == app_id)
            .cloned()
            .collect())
    }

    async fn put_job(&self, job: &ControllerJob) -> ClientResult<()> {
        let hanging = lock(&self.state).hanging_puts;
        if hanging {
            std::future::pending::<()>().await;
        }
        let mut state = lock(&self.state);
        if state.failing_puts > 0 {
            state.failing_puts -= 1;
            return Err(ClientError::Unavailable("controller write failed".to_string()));
        }
        state.puts.push(job.clone());
        Ok(())
    }
}
