//! redb table definitions for the rollout store.
//!
//! Record tables use `u64` ids and `&[u8]` values (JSON-serialized domain
//! types). String-keyed tables use composite keys of the form
//! `{parent_id}:{child_id}`.

use redb::TableDefinition;

/// Id sequences keyed by sequence name.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Rollouts keyed by rollout id.
pub const ROLLOUTS: TableDefinition<u64, &[u8]> = TableDefinition::new("rollouts");

/// Rollout groups keyed by group id.
pub const GROUPS: TableDefinition<u64, &[u8]> = TableDefinition::new("rollout_groups");

/// Group memberships keyed by `{rollout_id}:{target_id}`.
pub const MEMBERSHIPS: TableDefinition<&str, &[u8]> = TableDefinition::new("group_memberships");

/// Deployment actions keyed by action id.
pub const ACTIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("actions");

/// Registered targets keyed by target id.
pub const TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("targets");

/// Distributions keyed by distribution id.
pub const DISTRIBUTIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("distributions");

pub const ROLLOUT_SEQ: &str = "rollout";
pub const GROUP_SEQ: &str = "rollout_group";
pub const ACTION_SEQ: &str = "action";
pub const DISTRIBUTION_SEQ: &str = "distribution";
