//! Batch assigner: fills groups with targets and schedules their actions.
//!
//! Both phases work in bounded batches. Every batch runs in its own write
//! transaction, so partial progress survives a failure and a failed batch
//! only stops the current pass. The group keeps its status and the next
//! scheduler tick picks up where this one stopped.

use std::collections::HashSet;
use std::sync::Arc;

use fleetroll_state::*;
use tracing::{debug, info, warn};

use crate::error::{RolloutError, RolloutResult};
use crate::filter::TargetFilter;
use crate::matcher::TargetMatcher;
use crate::partition::percentage_of;

#[derive(Clone)]
pub struct BatchAssigner {
    store: StateStore,
    matcher: Arc<dyn TargetMatcher>,
    batch_size: usize,
}

impl BatchAssigner {
    pub fn new(store: StateStore, matcher: Arc<dyn TargetMatcher>, batch_size: usize) -> Self {
        Self {
            store,
            matcher,
            batch_size: batch_size.max(1),
        }
    }

    fn load(&self, rollout_id: RolloutId, group_id: GroupId) -> RolloutResult<(Rollout, RolloutGroup)> {
        let rollout = self
            .store
            .get_rollout(rollout_id)?
            .ok_or(RolloutError::RolloutNotFound(rollout_id))?;
        let group = self
            .store
            .get_group(group_id)?
            .ok_or(RolloutError::GroupNotFound(group_id))?;
        Ok((rollout, group))
    }

    /// Assign targets to a CREATING group until it holds its share of the
    /// pool, then mark it READY.
    ///
    /// Returns whether the group is READY (or already past it). A batch
    /// that fails transiently is logged and reported as `false`.
    pub fn fill_group(&self, rollout_id: RolloutId, group_id: GroupId) -> RolloutResult<bool> {
        let (rollout, group) = self.load(rollout_id, group_id)?;
        if group.status != GroupStatus::Creating {
            return Ok(true);
        }

        let filter = TargetFilter::for_group(&rollout.target_filter, &group.target_filter);
        let ready_groups = self.ready_groups_through(&rollout, group_id)?;
        let matching = self
            .matcher
            .count_matching_excluding(&filter, &ready_groups)?;
        let expected = percentage_of(group.target_percentage, matching);
        let current = self.store.count_members(rollout_id, group_id)?;

        let mut left = expected.saturating_sub(current);
        while left > 0 {
            let limit = (left as usize).min(self.batch_size);
            match self.assign_batch(&rollout, &filter, group_id, limit) {
                Ok(0) => {
                    debug!(rollout = rollout_id, group = group_id, "no unassigned targets left");
                    break;
                }
                Ok(assigned) => left = left.saturating_sub(assigned as u64),
                Err(e) => return defer_batch(e, rollout_id, group_id, "target assignment"),
            }
        }

        let total = self.store.write(|txn| -> RolloutResult<u64> {
            let mut group = txn.require_group(group_id)?;
            group.total_targets = txn.count_members(rollout_id, group_id)?;
            group.status = GroupStatus::Ready;
            group.updated_at = epoch_millis();
            txn.put_group(&group)?;
            Ok(group.total_targets)
        })?;
        info!(rollout = rollout_id, group = group_id, expected, total, "group ready");
        Ok(true)
    }

    /// READY groups from the start of the chain through `group_id`.
    fn ready_groups_through(&self, rollout: &Rollout, group_id: GroupId) -> RolloutResult<Vec<GroupId>> {
        let chain = rollout.chain_through(group_id);
        Ok(self
            .store
            .list_groups(rollout)?
            .into_iter()
            .filter(|g| g.status == GroupStatus::Ready && chain.contains(&g.id))
            .map(|g| g.id)
            .collect())
    }

    /// Claim up to `limit` targets nobody in the rollout holds yet.
    fn assign_batch(
        &self,
        rollout: &Rollout,
        filter: &TargetFilter,
        group_id: GroupId,
        limit: usize,
    ) -> RolloutResult<usize> {
        let candidates = self
            .matcher
            .page_matching_excluding(filter, &rollout.group_ids, 0, limit)?;
        if candidates.is_empty() {
            return Ok(0);
        }
        let now = epoch_millis();
        self.store.write(|txn| -> RolloutResult<usize> {
            let mut assigned = 0;
            for target_id in candidates {
                let membership = GroupMembership {
                    rollout_id: rollout.id,
                    group_id,
                    target_id,
                    assigned_at: now,
                };
                if txn.insert_membership(&membership)? {
                    assigned += 1;
                }
            }
            Ok(assigned)
        })
    }

    /// Create one scheduled, inactive action per member of a READY group,
    /// then mark it SCHEDULED.
    ///
    /// Returns whether the group is SCHEDULED (or already past it).
    pub fn schedule_group(&self, rollout_id: RolloutId, group_id: GroupId) -> RolloutResult<bool> {
        let (rollout, group) = self.load(rollout_id, group_id)?;
        match group.status {
            GroupStatus::Ready => {}
            GroupStatus::Creating => return Ok(false),
            _ => return Ok(true),
        }

        let members = self.store.count_members(rollout_id, group_id)?;
        let existing = self.store.count_actions(rollout_id, group_id)?;
        let mut left = members.saturating_sub(existing);
        while left > 0 {
            let limit = (left as usize).min(self.batch_size);
            match self.store.write(|txn| create_actions(txn, &rollout, group_id, limit)) {
                Ok(0) => break,
                Ok(created) => left = left.saturating_sub(created as u64),
                Err(e) => return defer_batch(e, rollout_id, group_id, "action scheduling"),
            }
        }

        let scheduled = self.store.write(|txn| -> RolloutResult<bool> {
            let mut group = txn.require_group(group_id)?;
            let members = txn.count_members(rollout_id, group_id)?;
            let actions = txn.group_actions(rollout_id, group_id)?.len() as u64;
            if actions < members {
                return Ok(false);
            }
            group.status = GroupStatus::Scheduled;
            group.updated_at = epoch_millis();
            txn.put_group(&group)?;
            Ok(true)
        })?;
        if scheduled {
            info!(rollout = rollout_id, group = group_id, members, "group scheduled");
        }
        Ok(scheduled)
    }
}

/// A transient batch failure ends this pass and the next tick retries it.
/// Anything else goes back to the caller.
fn defer_batch(
    e: RolloutError,
    rollout_id: RolloutId,
    group_id: GroupId,
    phase: &str,
) -> RolloutResult<bool> {
    if !e.is_transient() {
        return Err(e);
    }
    warn!(
        rollout = rollout_id,
        group = group_id,
        error = %e,
        "{phase} batch failed, retrying next tick"
    );
    Ok(false)
}

/// Create actions for up to `limit` members that have none yet, cancelling
/// any earlier scheduled action for the same targets first.
fn create_actions(
    txn: &mut StoreTxn<'_>,
    rollout: &Rollout,
    group_id: GroupId,
    limit: usize,
) -> RolloutResult<usize> {
    let covered: HashSet<TargetId> = txn
        .group_actions(rollout.id, group_id)?
        .into_iter()
        .map(|a| a.target_id)
        .collect();
    let pending: Vec<TargetId> = txn
        .group_members(rollout.id, group_id)?
        .into_iter()
        .filter(|t| !covered.contains(t))
        .take(limit)
        .collect();
    if pending.is_empty() {
        return Ok(0);
    }

    let now = epoch_millis();
    let targets: HashSet<&TargetId> = pending.iter().collect();
    let superseded =
        txn.actions_where(|a| a.status == ActionStatus::Scheduled && targets.contains(&a.target_id))?;
    for mut action in superseded {
        debug!(action = action.id, target = %action.target_id, "superseding scheduled action");
        action.status = ActionStatus::Canceled;
        action.active = false;
        action.updated_at = now;
        txn.put_action(&action)?;
    }

    for target_id in &pending {
        let action = Action {
            id: txn.next_id(ACTION_SEQ)?,
            target_id: target_id.clone(),
            distribution_id: rollout.distribution_id,
            status: ActionStatus::Scheduled,
            action_type: rollout.action_type,
            forced_time: rollout.forced_time,
            rollout_id: rollout.id,
            group_id,
            active: false,
            created_at: now,
            updated_at: now,
        };
        txn.put_action(&action)?;
    }
    Ok(pending.len())
}

/// Start a group's scheduled actions.
///
/// Other active, unfinished actions on the same targets are moved to
/// CANCELING first so each target runs one deployment at a time.
pub(crate) fn activate_group_actions(
    txn: &mut StoreTxn<'_>,
    rollout_id: RolloutId,
    group_id: GroupId,
) -> RolloutResult<usize> {
    let scheduled: Vec<Action> = txn
        .group_actions(rollout_id, group_id)?
        .into_iter()
        .filter(|a| a.status == ActionStatus::Scheduled)
        .collect();
    if scheduled.is_empty() {
        return Ok(0);
    }

    let now = epoch_millis();
    let targets: HashSet<TargetId> = scheduled.iter().map(|a| a.target_id.clone()).collect();
    let overridden =
        txn.actions_where(|a| a.active && !a.status.is_terminal() && targets.contains(&a.target_id))?;
    for mut action in overridden {
        action.status = ActionStatus::Canceling;
        action.updated_at = now;
        txn.put_action(&action)?;
    }

    let count = scheduled.len();
    for mut action in scheduled {
        action.status = ActionStatus::Running;
        action.active = true;
        action.updated_at = now;
        txn.put_action(&action)?;
    }
    debug!(rollout = rollout_id, group = group_id, count, "actions activated");
    Ok(count)
}
