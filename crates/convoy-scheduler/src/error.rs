//! Scheduler error types.

use thiserror::Error;
use uuid::Uuid;

use convoy_cluster::ClientError;
use convoy_placement::PlacementError;
use convoy_state::StateError;

/// Errors that can occur while running the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("timed out waiting for the initial {0} snapshot")]
    StartupTimeout(&'static str),

    #[error("discovery registration failed: {0}")]
    Registration(ClientError),

    #[error("not the leader")]
    NotLeader,

    #[error("job is not pending placement: {0}")]
    JobNotPending(Uuid),

    #[error("host is down: {0}")]
    HostIsDown(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("scheduler is not running")]
    Stopped,

    #[error("placement error: {0}")]
    Placement(#[from] PlacementError),

    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
