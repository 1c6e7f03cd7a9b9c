//! Error taxonomy for requests made against the rig.
//!
//! Validation failures reject a single request and never stop the daemons.

use thiserror::Error;

pub type RigResult<T> = Result<T, RigError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RigError {
    #[error("invalid circuit id {id}: expected 1..={max}")]
    InvalidCircuitId { id: i64, max: u8 },

    #[error("invalid program id {id}: expected 1..={max}")]
    InvalidProgramId { id: i64, max: u8 },

    #[error("invalid duration {minutes} min: must not be negative")]
    InvalidDuration { minutes: i64 },

    /// The watering config document does not match the schema.
    #[error("watering config schema error: {0}")]
    Schema(String),

    /// The watering config could not be written; the running schedule is unchanged.
    #[error("failed to persist watering config: {0}")]
    Persistence(String),

    /// The execution queue is gone (process is shutting down).
    #[error("execution arbiter is not accepting submissions")]
    ArbiterClosed,
}

impl RigError {
    /// True for errors caused by the caller's input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidCircuitId { .. }
                | Self::InvalidProgramId { .. }
                | Self::InvalidDuration { .. }
                | Self::Schema(_)
        )
    }
}
