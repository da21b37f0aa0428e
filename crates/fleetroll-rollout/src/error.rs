//! Engine error taxonomy.

use fleetroll_state::{DistributionId, GroupId, RolloutId, StateError};
use thiserror::Error;

use crate::matcher::MatchError;

pub type RolloutResult<T> = Result<T, RolloutError>;

#[derive(Debug, Error)]
pub enum RolloutError {
    /// Bad input; nothing was persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The rollout is in the wrong status for the requested operation.
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("rollout {0} not found")]
    RolloutNotFound(RolloutId),

    #[error("rollout group {0} not found")]
    GroupNotFound(GroupId),

    #[error("distribution {0} not found")]
    DistributionNotFound(DistributionId),

    #[error(transparent)]
    Matcher(#[from] MatchError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl RolloutError {
    /// Failures of the store underneath, which a later tick may not repeat.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::State(e) | Self::Matcher(MatchError::Store(e)) => e.is_transient(),
            _ => false,
        }
    }
}
