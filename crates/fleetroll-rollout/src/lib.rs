//! fleetroll-rollout: staged rollout engine.
//!
//! A rollout deploys one distribution to a filtered target population in
//! ordered groups. Each group advances only once its predecessor satisfies
//! a success condition; an error condition can pause the whole rollout.
//!
//! # Components
//!
//! - **`filter`**: Structured target filters built from opaque query leaves
//! - **`matcher`**: The `TargetMatcher` seam and its store-backed implementation
//! - **`partition`**: Group validation and per-group target estimates
//! - **`assigner`**: Batched target-to-group assignment and action scheduling
//! - **`condition`**: Condition evaluators and group action handlers
//! - **`executor`**: Per-status processing the scheduler drives each tick
//! - **`manager`**: Caller-facing operations (create, start, pause, resume)

pub mod assigner;
pub mod condition;
pub mod error;
pub mod executor;
pub mod filter;
pub mod manager;
pub mod matcher;
pub mod partition;

pub use assigner::BatchAssigner;
pub use condition::{ConditionEvaluator, ConditionRegistry, GroupActionHandler};
pub use error::{RolloutError, RolloutResult};
pub use executor::RolloutExecutor;
pub use filter::TargetFilter;
pub use manager::{
    ActionCounts, CreateRollout, GroupLayout, GroupProgress, RolloutManager, RolloutProgress,
};
pub use matcher::{MatchError, StoreTargetMatcher, TargetMatcher};
pub use partition::{validate_groups, GroupDefinition, GroupsValidation};
