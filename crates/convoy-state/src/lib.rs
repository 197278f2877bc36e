//! convoy-state: in-memory state for the Convoy scheduler.
//!
//! Holds the formation table and the job table owned by the scheduler's
//! event pump, plus the data types exchanged with the controller, the
//! cluster and individual hosts.
//!
//! # Architecture
//!
//! ```text
//! FormationTable   (app_id, release_id) → Formation
//! JobTable         scheduler UUID → Job
//!   ├── by host       host_id → {UUID}
//!   └── by formation  key → type → {UUID}
//! ```
//!
//! Neither table is shared: the event pump is the only reader and writer,
//! so both are plain structs with `&mut self` mutators and no locking.
//! Jobs refer to formations by key only.

pub mod error;
pub mod formations;
pub mod jobs;
pub mod types;

pub use error::{StateError, StateResult};
pub use formations::{FormationChange, FormationTable};
pub use jobs::JobTable;
pub use types::*;
