//! Scheduler error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("state store error: {0}")]
    State(#[from] fleetroll_state::StateError),

    #[error("scheduler task failed: {0}")]
    Task(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
