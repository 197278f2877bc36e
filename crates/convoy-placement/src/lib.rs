//! Convoy placement: where does the next job go?
//!
//! Placement is by per-type job-count fairness only: among available hosts
//! whose tags satisfy the process type's predicate, pick the one running
//! the fewest jobs of the same (formation, type). There is no resource
//! bin-packing and no preemption.
//!
//! # Components
//!
//! - **`scorer`**: Tag predicate and per-host candidate records
//! - **`placer`**: Least-loaded host selection
//! - **`convert`**: Candidate lists from the host and job tables

pub mod convert;
pub mod placer;
pub mod scorer;

pub use convert::{candidates, matching_host_count, matching_host_ids};
pub use placer::{PlacementError, choose_host};
pub use scorer::{HostCandidate, tags_match};
