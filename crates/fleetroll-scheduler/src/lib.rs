//! fleetroll-scheduler: the rollout claim loop.
//!
//! One control loop drives four batch jobs, one per actionable rollout
//! status. Each job first claims the rollouts due for processing by
//! stamping their `last_check` in a single atomic update, then re-reads the
//! rollouts carrying its stamp and processes only those. Several scheduler
//! processes can share one store: a rollout stamped by one of them is not
//! stale for the others until the claim delay has passed.
//!
//! ```text
//! RolloutScheduler::tick(now)
//!   ├── Creating  → RolloutExecutor::handle_creating
//!   ├── Starting  → RolloutExecutor::handle_starting
//!   ├── Ready     → RolloutExecutor::handle_ready
//!   └── Running   → RolloutExecutor::handle_running
//! ```

pub mod error;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{JobReport, RolloutScheduler, SchedulerJob};
