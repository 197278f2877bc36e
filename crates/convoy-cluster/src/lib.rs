//! convoy-cluster: the scheduler's view of the cluster.
//!
//! Defines the collaborator contracts the scheduler consumes (discovery,
//! controller, cluster and host clients), and the host-side machinery the
//! event pump drives: one follower task per host, consecutive-failure
//! health tracking, and the host membership table.
//!
//! # Architecture
//!
//! ```text
//! HostTable
//!   └── Host (per followed host)
//!       ├── HostHealth (healthy flag, consecutive failed checks)
//!       └── Follower task
//!           ├── ListJobs() → synthetic snapshot events
//!           ├── StreamEvents() → live job events, in order
//!           └── StreamLost → reconnect after retry delay
//! ```

pub mod client;
pub mod error;
pub mod health;
pub mod host;
pub mod membership;

pub use client::{ClusterClient, ControllerClient, Discovery, HostClient, with_timeout};
pub use error::{ClientError, ClientResult};
pub use health::{CheckResult, HealthVerdict, HostHealth};
pub use host::{Host, HostUpdate};
pub use membership::HostTable;
