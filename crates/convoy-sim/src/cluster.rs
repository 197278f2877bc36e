//! Simulated host registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use convoy_cluster::{ClientError, ClientResult, ClusterClient, HostClient};
use convoy_state::{DiscoveryEvent, DiscoveryEventKind, HOST_TAG_PREFIX, HostId, Instance, META_SHUTDOWN, Tags};

use crate::host::FakeHost;
use crate::{STREAM_CAPACITY, broadcast, lock};

#[derive(Default)]
struct ClusterState {
    hosts: BTreeMap<HostId, Arc<FakeHost>>,
    subscribers: Vec<mpsc::Sender<DiscoveryEvent>>,
    /// Hosts that fail `host()` lookups.
    unresolvable: HashMap<HostId, ClientError>,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a host and announce it.
    pub fn add_host(&self, host: Arc<FakeHost>) {
        let mut state = lock(&self.state);
        let event = DiscoveryEvent::new(DiscoveryEventKind::Up, instance(host.host_id(), &host.tags(), false));
        state.hosts.insert(host.host_id().to_string(), host);
        broadcast(&mut state.subscribers, event);
    }

    /// Deregister a host as if it shut down cleanly.
    pub fn shutdown_host(&self, host_id: &str) -> Option<Arc<FakeHost>> {
        self.remove(host_id, true)
    }

    /// Deregister a host without a shutdown notice, as if it vanished.
    pub fn remove_host(&self, host_id: &str) -> Option<Arc<FakeHost>> {
        self.remove(host_id, false)
    }

    /// Change a host's tags and announce the update.
    pub fn set_host_tags(&self, host_id: &str, tags: Tags) -> bool {
        let mut state = lock(&self.state);
        let Some(host) = state.hosts.get(host_id) else {
            return false;
        };
        host.set_tags(tags.clone());
        let event = DiscoveryEvent::new(DiscoveryEventKind::Update, instance(host_id, &tags, false));
        broadcast(&mut state.subscribers, event);
        true
    }

    /// Make `host()` lookups for a host fail until cleared with `None`.
    pub fn set_unresolvable(&self, host_id: &str, error: Option<ClientError>) {
        let mut state = lock(&self.state);
        match error {
            Some(error) => {
                state.unresolvable.insert(host_id.to_string(), error);
            }
            None => {
                state.unresolvable.remove(host_id);
            }
        }
    }

    pub fn host_ids(&self) -> Vec<HostId> {
        lock(&self.state).hosts.keys().cloned().collect()
    }

    pub fn fake_host(&self, host_id: &str) -> Option<Arc<FakeHost>> {
        lock(&self.state).hosts.get(host_id).cloned()
    }

    fn remove(&self, host_id: &str, shutdown: bool) -> Option<Arc<FakeHost>> {
        let mut state = lock(&self.state);
        let host = state.hosts.remove(host_id)?;
        let event = DiscoveryEvent::new(DiscoveryEventKind::Down, instance(host_id, &host.tags(), shutdown));
        broadcast(&mut state.subscribers, event);
        Some(host)
    }
}

/// Discovery instance announcing a host, with its tags in the metadata.
pub fn instance(host_id: &str, tags: &Tags, shutdown: bool) -> Instance {
    let mut meta: BTreeMap<String, String> = tags
        .iter()
        .map(|(k, v)| (format!("{HOST_TAG_PREFIX}{k}"), v.clone()))
        .collect();
    if shutdown {
        meta.insert(META_SHUTDOWN.to_string(), "true".to_string());
    }
    Instance {
        id: host_id.to_string(),
        addr: format!("{host_id}.cluster.local:1113"),
        meta,
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn hosts(&self) -> ClientResult<Vec<Arc<dyn HostClient>>> {
        Ok(lock(&self.state)
            .hosts
            .values()
            .map(|host| host.clone() as Arc<dyn HostClient>)
            .collect())
    }

    async fn host(&self, id: &str) -> ClientResult<Arc<dyn HostClient>> {
        let state = lock(&self.state);
        if let Some(error) = state.unresolvable.get(id) {
            return Err(error.clone());
        }
        state
            .hosts
            .get(id)
            .map(|host| host.clone() as Arc<dyn HostClient>)
            .ok_or_else(|| ClientError::NotFound(format!("host {id}")))
    }

    async fn stream_host_events(&self) -> ClientResult<mpsc::Receiver<DiscoveryEvent>> {
        let mut state = lock(&self.state);
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        for (id, host) in &state.hosts {
            let event = DiscoveryEvent::new(DiscoveryEventKind::Up, instance(id, &host.tags(), false));
            if tx.try_send(event).is_err() {
                return Err(ClientError::Unavailable("host snapshot too large".to_string()));
            }
        }
        if tx.try_send(DiscoveryEvent::current()).is_err() {
            return Err(ClientError::Unavailable("host snapshot too large".to_string()));
        }
        state.subscribers.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_sends_snapshot_then_current_then_live_events() {
        let cluster = FakeCluster::new();
        cluster.add_host(FakeHost::new("host1"));
        let mut events = cluster.stream_host_events().await.unwrap();

        let up = events.recv().await.unwrap();
        assert_eq!(up.kind, DiscoveryEventKind::Up);
        assert_eq!(up.instance.unwrap().id, "host1");
        assert_eq!(events.recv().await.unwrap().kind, DiscoveryEventKind::Current);

        cluster.shutdown_host("host1");
        let down = events.recv().await.unwrap();
        assert_eq!(down.kind, DiscoveryEventKind::Down);
        assert!(down.instance.unwrap().is_shutdown());
    }

    #[test]
    fn instance_carries_host_tags() {
        let tags = Tags::from([("disk".to_string(), "ssd".to_string())]);
        let inst = instance("host1", &tags, false);
        assert_eq!(inst.host_tags(), tags);
        assert!(!inst.is_shutdown());
    }

    #[tokio::test]
    async fn unresolvable_hosts_fail_lookup() {
        let cluster = FakeCluster::new();
        cluster.add_host(FakeHost::new("host1"));
        cluster.set_unresolvable("host1", Some(ClientError::Timeout));
        assert!(matches!(cluster.host("host1").await, Err(ClientError::Timeout)));
        cluster.set_unresolvable("host1", None);
        assert!(cluster.host("host1").await.is_ok());
    }
}
