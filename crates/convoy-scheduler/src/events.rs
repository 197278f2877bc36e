//! Scheduler events and the subscriber bus.
//!
//! Every notable state change is published to all subscribers. Delivery
//! never blocks the pump: a subscriber whose channel is full misses the
//! event, and a subscriber whose receiver is gone is removed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::trace;

use convoy_state::{FormationKey, HostId, Job};

/// How a host's standing in the cluster changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEventKind {
    Up,
    Down,
    Unhealthy,
    Healthy,
    Updated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A job reached a host and started.
    JobStart { job: Job },
    /// A job reached `Stopped`.
    JobStop { job: Job },
    /// A job was requested. `delay` is the restart back-off before the
    /// request is processed; `error` is set when placement failed.
    JobRequest {
        job: Job,
        attempt: u32,
        delay: Duration,
        error: Option<String>,
    },
    LeaderChange { is_leader: bool },
    FormationChange { formation: FormationKey },
    FormationSync { error: Option<String> },
    ClusterSync { error: Option<String> },
    HostEvent { host_id: HostId, kind: HostEventKind },
    /// Reconciliation ran for a formation.
    Rectify { formation: FormationKey },
}

/// Discriminant of [`Event`], for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    JobStart,
    JobStop,
    JobRequest,
    LeaderChange,
    FormationChange,
    FormationSync,
    ClusterSync,
    HostEvent,
    Rectify,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::JobStart { .. } => EventKind::JobStart,
            Self::JobStop { .. } => EventKind::JobStop,
            Self::JobRequest { .. } => EventKind::JobRequest,
            Self::LeaderChange { .. } => EventKind::LeaderChange,
            Self::FormationChange { .. } => EventKind::FormationChange,
            Self::FormationSync { .. } => EventKind::FormationSync,
            Self::ClusterSync { .. } => EventKind::ClusterSync,
            Self::HostEvent { .. } => EventKind::HostEvent,
            Self::Rectify { .. } => EventKind::Rectify,
        }
    }

    /// The job carried by job events.
    pub fn job(&self) -> Option<&Job> {
        match self {
            Self::JobStart { job } | Self::JobStop { job } | Self::JobRequest { job, .. } => Some(job),
            _ => None,
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
struct BusInner {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

/// Fan-out of scheduler events to subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber with a channel of `capacity` events.
    pub fn subscribe(&self, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.write().push(Subscriber { id, tx });
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every subscriber without blocking.
    pub fn publish(&self, event: Event) {
        let mut closed = false;
        for subscriber in self.read().iter() {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    trace!(subscriber = subscriber.id, kind = ?event.kind(), "subscriber full, event dropped");
                }
                Err(TrySendError::Closed(_)) => closed = true,
            }
        }
        if closed {
            self.write().retain(|s| !s.tx.is_closed());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.read().len()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Subscriber>> {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Subscriber>> {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// A registered event receiver. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Wait for the next event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Event, TryRecvError> {
        self.rx.try_recv()
    }

    /// Wait for the next event matching `predicate`, discarding others.
    pub async fn recv_matching(&mut self, mut predicate: impl FnMut(&Event) -> bool) -> Option<Event> {
        while let Some(event) = self.rx.recv().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            EventBus { inner }.write().retain(|s| s.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leader(is_leader: bool) -> Event {
        Event::LeaderChange { is_leader }
    }

    #[tokio::test]
    async fn every_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(8);
        let mut b = bus.subscribe(8);

        bus.publish(leader(true));

        assert_eq!(a.recv().await.unwrap(), leader(true));
        assert_eq!(b.recv().await.unwrap(), leader(true));
    }

    #[tokio::test]
    async fn full_subscriber_drops_without_blocking_others() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe(1);
        let mut fast = bus.subscribe(8);

        bus.publish(leader(true));
        bus.publish(leader(false));

        assert_eq!(slow.recv().await.unwrap(), leader(true));
        assert!(matches!(slow.try_recv(), Err(TryRecvError::Empty)));

        assert_eq!(fast.recv().await.unwrap(), leader(true));
        assert_eq!(fast.recv().await.unwrap(), leader(false));
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = EventBus::new();
        let sub = bus.subscribe(4);
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(leader(true));
    }

    #[tokio::test]
    async fn subscription_ends_when_bus_is_dropped() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(4);
        bus.publish(leader(true));
        drop(bus);
        assert_eq!(sub.recv().await, Some(leader(true)));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn recv_matching_skips_other_events() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(8);
        bus.publish(leader(true));
        bus.publish(Event::ClusterSync { error: None });

        let event = sub
            .recv_matching(|e| e.kind() == EventKind::ClusterSync)
            .await
            .unwrap();
        assert_eq!(event, Event::ClusterSync { error: None });
    }
}
