//! convoy-sim: in-memory collaborators for the Convoy scheduler.
//!
//! Every collaborator contract from `convoy-cluster` has a fake here that
//! keeps its state behind a mutex and serves streams from bounded
//! channels. Tests and the `convoyd simulate` command drive a scheduler
//! against these fakes and mutate them to inject host failures, crashes
//! and formation changes.
//!
//! # Architecture
//!
//! ```text
//! FakeDiscovery   leader flag, service instances
//! FakeController  formations, recorded job writes
//! FakeCluster     host registry
//!   └── FakeHost  jobs, event streams, recorded calls
//! ```

pub mod cluster;
pub mod controller;
pub mod discovery;
pub mod fixtures;
pub mod host;

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

pub use cluster::FakeCluster;
pub use controller::FakeController;
pub use discovery::FakeDiscovery;
pub use fixtures::FormationBuilder;
pub use host::{FakeHost, HostCall};

/// Capacity of every stream served by a fake.
pub const STREAM_CAPACITY: usize = 1024;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Send `item` to every open subscriber, dropping closed ones.
pub(crate) fn broadcast<T: Clone>(subscribers: &mut Vec<mpsc::Sender<T>>, item: T) {
    subscribers.retain(|tx| match tx.try_send(item.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("simulated stream full, dropping item");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    });
}
