//! Error types for the scheduler state tables.

use thiserror::Error;
use uuid::Uuid;

use crate::types::FormationKey;

/// Result type alias for state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors raised while decoding or looking up scheduler state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("job metadata missing key: {0}")]
    MissingMetadata(&'static str),

    #[error("invalid scheduler id: {0}")]
    InvalidSchedulerId(String),

    #[error("invalid formation key: {0}")]
    InvalidFormationKey(String),

    #[error("formation not found: {0}")]
    FormationNotFound(FormationKey),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),
}
