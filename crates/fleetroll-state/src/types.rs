//! Domain types for the rollout store.
//!
//! These types represent the persisted state of rollouts, their groups,
//! group memberships, deployment actions, and the target/distribution
//! registry. All types are serializable to/from JSON for storage in redb
//! tables.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub type RolloutId = u64;
pub type GroupId = u64;
pub type ActionId = u64;
pub type DistributionId = u64;

/// Targets are addressed by their controller id.
pub type TargetId = String;

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Registry ───────────────────────────────────────────────────────

/// A managed device eligible to receive deployments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub id: TargetId,
    /// Attributes reported by the device, matched by target filters.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub created_at: u64,
}

impl Target {
    pub fn new(id: impl Into<TargetId>) -> Self {
        Self {
            id: id.into(),
            attributes: BTreeMap::new(),
            created_at: epoch_millis(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// A software distribution a rollout deploys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Distribution {
    pub id: DistributionId,
    pub name: String,
    pub version: String,
    pub created_at: u64,
}

// ── Rollout ────────────────────────────────────────────────────────

/// How a deployment action is applied on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    #[default]
    Forced,
    Soft,
    /// Soft until `forced_time`, forced afterwards.
    TimeForced,
    DownloadOnly,
}

/// Lifecycle status of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Creating,
    Ready,
    Starting,
    Running,
    Paused,
    Finished,
}

impl fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// A staged deployment campaign over a filtered target population.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rollout {
    pub id: RolloutId,
    /// Unique across rollouts.
    pub name: String,
    pub description: Option<String>,
    pub distribution_id: DistributionId,
    /// Base target filter every group refines.
    pub target_filter: String,
    pub action_type: ActionType,
    /// Unix millis after which a time-forced action becomes forced.
    pub forced_time: u64,
    /// Unix millis at which a READY rollout starts on its own.
    pub start_at: Option<u64>,
    pub status: RolloutStatus,
    /// Denormalized sum of the group totals; corrected when targets vanish.
    pub total_targets: u64,
    /// Groups in chain order. Group `i` has group `i - 1` as its parent.
    pub group_ids: Vec<GroupId>,
    /// Unix millis of the last scheduler claim; 0 means "due now".
    pub last_check: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Rollout {
    /// The group processed first; it has no parent.
    pub fn first_group(&self) -> Option<GroupId> {
        self.group_ids.first().copied()
    }

    /// Parent of `group` in the chain, `None` for the first group or an unknown id.
    pub fn parent_of(&self, group: GroupId) -> Option<GroupId> {
        let pos = self.position_of(group)?;
        pos.checked_sub(1).map(|p| self.group_ids[p])
    }

    /// The group whose parent is `group`.
    pub fn child_of(&self, group: GroupId) -> Option<GroupId> {
        let pos = self.position_of(group)?;
        self.group_ids.get(pos + 1).copied()
    }

    /// Chain prefix from the first group through `group` inclusive.
    pub fn chain_through(&self, group: GroupId) -> &[GroupId] {
        match self.position_of(group) {
            Some(pos) => &self.group_ids[..=pos],
            None => &[],
        }
    }

    pub fn position_of(&self, group: GroupId) -> Option<usize> {
        self.group_ids.iter().position(|id| *id == group)
    }
}

// ── Rollout group ──────────────────────────────────────────────────

/// Lifecycle status of a rollout group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Creating,
    Ready,
    Scheduled,
    Running,
    Finished,
    Error,
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Names a condition evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    FinishedThreshold,
    ErrorThreshold,
}

/// Predicate over a running group, carrying its free-form expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "expression", rename_all = "snake_case")]
pub enum GroupCondition {
    /// Trips when at least `expression` percent of the group's targets finished.
    FinishedThreshold(String),
    /// Trips when more than `expression` percent of the group's actions errored.
    ErrorThreshold(String),
}

impl GroupCondition {
    pub fn kind(&self) -> ConditionKind {
        match self {
            Self::FinishedThreshold(_) => ConditionKind::FinishedThreshold,
            Self::ErrorThreshold(_) => ConditionKind::ErrorThreshold,
        }
    }

    pub fn expression(&self) -> &str {
        match self {
            Self::FinishedThreshold(e) | Self::ErrorThreshold(e) => e,
        }
    }
}

/// Names a group action handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    StartNextGroup,
    PauseRollout,
}

/// Behaviour triggered when a group condition trips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "expression", rename_all = "snake_case")]
pub enum GroupAction {
    /// Activate the successor group's scheduled actions and mark it running.
    StartNextGroup(String),
    /// Mark the group errored and pause the rollout.
    PauseRollout(String),
}

impl GroupAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::StartNextGroup(_) => ActionKind::StartNextGroup,
            Self::PauseRollout(_) => ActionKind::PauseRollout,
        }
    }

    pub fn expression(&self) -> &str {
        match self {
            Self::StartNextGroup(e) | Self::PauseRollout(e) => e,
        }
    }
}

/// Success and error rules of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConditions {
    pub success_condition: GroupCondition,
    pub success_action: GroupAction,
    #[serde(default)]
    pub error_condition: Option<GroupCondition>,
    #[serde(default)]
    pub error_action: Option<GroupAction>,
}

impl GroupConditions {
    /// Advance to the next group once `threshold` percent finished; no error rule.
    pub fn finished_threshold(threshold: impl Into<String>) -> Self {
        Self {
            success_condition: GroupCondition::FinishedThreshold(threshold.into()),
            success_action: GroupAction::StartNextGroup(String::new()),
            error_condition: None,
            error_action: None,
        }
    }

    /// Pause the rollout once more than `threshold` percent errored.
    pub fn with_error_threshold(mut self, threshold: impl Into<String>) -> Self {
        self.error_condition = Some(GroupCondition::ErrorThreshold(threshold.into()));
        self.error_action = Some(GroupAction::PauseRollout(String::new()));
        self
    }
}

/// An ordered subset of a rollout's targets, advanced as a unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutGroup {
    pub id: GroupId,
    pub rollout_id: RolloutId,
    pub name: String,
    pub description: Option<String>,
    pub status: GroupStatus,
    /// Share of the remaining matching pool this group claims, in (0, 100].
    pub target_percentage: f64,
    /// Refinement ANDed onto the rollout filter; empty means none.
    pub target_filter: String,
    /// Denormalized membership count.
    pub total_targets: u64,
    pub conditions: GroupConditions,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Membership ─────────────────────────────────────────────────────

/// Records that a target has been committed to one group of a rollout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMembership {
    pub rollout_id: RolloutId,
    pub group_id: GroupId,
    pub target_id: TargetId,
    pub assigned_at: u64,
}

impl GroupMembership {
    /// Build the composite key for the memberships table.
    pub fn table_key(&self) -> String {
        membership_key(self.rollout_id, &self.target_id)
    }
}

pub fn membership_key(rollout_id: RolloutId, target_id: &str) -> String {
    format!("{rollout_id}:{target_id}")
}

// ── Action ─────────────────────────────────────────────────────────

/// Progress of a deployment action, reported by the device side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Scheduled,
    Running,
    Retrieved,
    Downloading,
    Downloaded,
    Warning,
    Canceling,
    Canceled,
    Finished,
    Error,
}

impl ActionStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Canceled)
    }
}

/// "Deploy distribution D to target T", created per target per group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Action {
    pub id: ActionId,
    pub target_id: TargetId,
    pub distribution_id: DistributionId,
    pub status: ActionStatus,
    pub action_type: ActionType,
    pub forced_time: u64,
    pub rollout_id: RolloutId,
    pub group_id: GroupId,
    /// Scheduled actions stay inactive until their group starts.
    pub active: bool,
    pub created_at: u64,
    pub updated_at: u64,
}
