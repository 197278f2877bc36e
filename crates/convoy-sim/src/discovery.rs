//! Simulated service discovery and leader election.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use convoy_cluster::{ClientError, ClientResult, Discovery};
use convoy_state::{DiscoveryEvent, DiscoveryEventKind, Instance, META_JOB_ID};

use crate::{STREAM_CAPACITY, broadcast, lock};

struct DiscoveryState {
    is_leader: bool,
    registrations: u32,
    fail_register: bool,
    leader_subscribers: Vec<mpsc::Sender<bool>>,
    /// Service name → instance id → instance.
    services: BTreeMap<String, BTreeMap<String, Instance>>,
    service_subscribers: BTreeMap<String, Vec<mpsc::Sender<DiscoveryEvent>>>,
}

pub struct FakeDiscovery {
    state: Mutex<DiscoveryState>,
}

impl FakeDiscovery {
    pub fn new(is_leader: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DiscoveryState {
                is_leader,
                registrations: 0,
                fail_register: false,
                leader_subscribers: Vec::new(),
                services: BTreeMap::new(),
                service_subscribers: BTreeMap::new(),
            }),
        })
    }

    /// Change leadership and notify leader subscribers.
    pub fn set_leader(&self, is_leader: bool) {
        let mut state = lock(&self.state);
        if state.is_leader == is_leader {
            return;
        }
        state.is_leader = is_leader;
        broadcast(&mut state.leader_subscribers, is_leader);
    }

    pub fn set_fail_register(&self, fail: bool) {
        lock(&self.state).fail_register = fail;
    }

    pub fn registrations(&self) -> u32 {
        lock(&self.state).registrations
    }

    /// Register an instance of `service` backed by cluster job `job_id`.
    pub fn service_up(&self, service: &str, instance_id: &str, job_id: &str) {
        let instance = Instance {
            id: instance_id.to_string(),
            addr: format!("{instance_id}.{service}.discoverd:8080"),
            meta: BTreeMap::from([(META_JOB_ID.to_string(), job_id.to_string())]),
        };
        let mut state = lock(&self.state);
        state
            .services
            .entry(service.to_string())
            .or_default()
            .insert(instance_id.to_string(), instance.clone());
        if let Some(subscribers) = state.service_subscribers.get_mut(service) {
            broadcast(subscribers, DiscoveryEvent::new(DiscoveryEventKind::Up, instance));
        }
    }

    pub fn service_down(&self, service: &str, instance_id: &str) -> bool {
        let mut state = lock(&self.state);
        let Some(instance) = state
            .services
            .get_mut(service)
            .and_then(|instances| instances.remove(instance_id))
        else {
            return false;
        };
        if let Some(subscribers) = state.service_subscribers.get_mut(service) {
            broadcast(subscribers, DiscoveryEvent::new(DiscoveryEventKind::Down, instance));
        }
        true
    }

    /// Services with at least one open watch.
    pub fn watched_services(&self) -> Vec<String> {
        let mut state = lock(&self.state);
        state.service_subscribers.retain(|_, subs| {
            subs.retain(|tx| !tx.is_closed());
            !subs.is_empty()
        });
        state.service_subscribers.keys().cloned().collect()
    }
}

#[async_trait]
impl Discovery for FakeDiscovery {
    async fn register(&self) -> ClientResult<bool> {
        let mut state = lock(&self.state);
        if state.fail_register {
            return Err(ClientError::Unavailable("discovery unreachable".to_string()));
        }
        state.registrations += 1;
        Ok(state.is_leader)
    }

    async fn leader_changes(&self) -> ClientResult<mpsc::Receiver<bool>> {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        lock(&self.state).leader_subscribers.push(tx);
        Ok(rx)
    }

    async fn watch(&self, service: &str) -> ClientResult<mpsc::Receiver<DiscoveryEvent>> {
        let mut state = lock(&self.state);
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let snapshot = state.services.get(service).into_iter().flat_map(|i| i.values());
        for instance in snapshot {
            if tx
                .try_send(DiscoveryEvent::new(DiscoveryEventKind::Up, instance.clone()))
                .is_err()
            {
                return Err(ClientError::Unavailable("service snapshot too large".to_string()));
            }
        }
        if tx.try_send(DiscoveryEvent::current()).is_err() {
            return Err(ClientError::Unavailable("service snapshot too large".to_string()));
        }
        state
            .service_subscribers
            .entry(service.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn leader_changes_are_streamed_once() {
        let discovery = FakeDiscovery::new(false);
        assert!(!discovery.register().await.unwrap());
        let mut changes = discovery.leader_changes().await.unwrap();

        discovery.set_leader(true);
        discovery.set_leader(true);
        discovery.set_leader(false);
        assert_eq!(changes.recv().await, Some(true));
        assert_eq!(changes.recv().await, Some(false));
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn watch_replays_instances_before_current() {
        let discovery = FakeDiscovery::new(true);
        discovery.service_up("web", "inst-1", "host1-a");
        let mut events = discovery.watch("web").await.unwrap();

        let up = events.recv().await.unwrap();
        assert_eq!(up.kind, DiscoveryEventKind::Up);
        assert_eq!(up.instance.unwrap().job_id(), Some("host1-a"));
        assert_eq!(events.recv().await.unwrap().kind, DiscoveryEventKind::Current);

        assert!(discovery.service_down("web", "inst-1"));
        assert_eq!(events.recv().await.unwrap().kind, DiscoveryEventKind::Down);
        assert_eq!(discovery.watched_services(), vec!["web".to_string()]);
    }
}
