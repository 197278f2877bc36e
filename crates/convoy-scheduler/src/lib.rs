//! convoy-scheduler: leader-elected reconciliation of formations.
//!
//! The scheduler keeps the set of jobs running across the cluster equal
//! to what the controller's formations ask for. Every scheduler instance
//! follows every host and formation; only the leader starts, stops and
//! persists jobs.
//!
//! # Architecture
//!
//! ```text
//! Scheduler::run
//!   ├── watchers (host events, formations, services) ──┐
//!   ├── host followers (one per host) ──────────────────┤
//!   ├── tickers (sync jobs / formations / hosts) ───────┤
//!   │                                                   ▼
//!   │                                        ┌──── event pump ────┐
//!   │                                        │ hosts · formations │
//!   │                                        │ jobs · reconcile   │
//!   │                                        └─────────┬──────────┘
//!   │                      RPC tasks ◄─────────────────┤
//!   ├── persistence writer ◄───────────────────────────┤
//!   └── event bus ◄────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod persist;
pub mod reconcile;
pub mod restart;
pub mod scheduler;
pub mod snapshot;
pub mod streams;

mod pump;

pub use config::{SchedulerConfig, parse_duration};
pub use error::{SchedulerError, SchedulerResult};
pub use events::{Event, EventBus, EventKind, HostEventKind, Subscription};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use snapshot::{FormationSummary, HostSummary, JobSummary, Snapshot};
