//! Rollout executor: one step of the state machine per call.
//!
//! The scheduler claims rollouts by status and hands each one to the
//! matching `handle_*` method. Every handler re-reads the rollout first and
//! does nothing if its status moved on since the claim.

use std::sync::Arc;

use fleetroll_state::*;
use tracing::{debug, info};

use crate::assigner::{activate_group_actions, BatchAssigner};
use crate::condition::ConditionRegistry;
use crate::error::{RolloutError, RolloutResult};
use crate::matcher::TargetMatcher;

#[derive(Clone)]
pub struct RolloutExecutor {
    store: StateStore,
    assigner: BatchAssigner,
    conditions: Arc<ConditionRegistry>,
}

impl RolloutExecutor {
    pub fn new(store: StateStore, matcher: Arc<dyn TargetMatcher>, batch_size: usize) -> Self {
        Self {
            assigner: BatchAssigner::new(store.clone(), matcher, batch_size),
            store,
            conditions: Arc::new(ConditionRegistry::default()),
        }
    }

    pub fn with_conditions(mut self, conditions: ConditionRegistry) -> Self {
        self.conditions = Arc::new(conditions);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn load(&self, id: RolloutId, status: RolloutStatus) -> RolloutResult<Option<Rollout>> {
        let rollout = self
            .store
            .get_rollout(id)?
            .ok_or(RolloutError::RolloutNotFound(id))?;
        if rollout.status != status {
            debug!(rollout = id, %status, actual = %rollout.status, "status changed since claim");
            return Ok(None);
        }
        Ok(Some(rollout))
    }

    /// Fill groups in chain order; promote the rollout to READY once all are.
    pub fn handle_creating(&self, id: RolloutId) -> RolloutResult<()> {
        let Some(rollout) = self.load(id, RolloutStatus::Creating)? else {
            return Ok(());
        };
        for group_id in &rollout.group_ids {
            if !self.assigner.fill_group(id, *group_id)? {
                debug!(rollout = id, group = group_id, "group fill incomplete");
                return Ok(());
            }
        }

        let promoted = self.store.write(|txn| -> RolloutResult<Option<u64>> {
            let mut rollout = txn.require_rollout(id)?;
            if rollout.status != RolloutStatus::Creating {
                return Ok(None);
            }
            let groups = txn.groups(&rollout)?;
            if groups.iter().any(|g| g.status != GroupStatus::Ready) {
                return Ok(None);
            }
            rollout.total_targets = groups.iter().map(|g| g.total_targets).sum();
            rollout.status = RolloutStatus::Ready;
            rollout.last_check = 0;
            rollout.updated_at = epoch_millis();
            txn.put_rollout(&rollout)?;
            Ok(Some(rollout.total_targets))
        })?;
        if let Some(total_targets) = promoted {
            info!(rollout = id, total_targets, "rollout ready");
        }
        Ok(())
    }

    /// Schedule every group's actions; once all are SCHEDULED, start the
    /// first group and mark the rollout RUNNING.
    pub fn handle_starting(&self, id: RolloutId) -> RolloutResult<()> {
        let Some(rollout) = self.load(id, RolloutStatus::Starting)? else {
            return Ok(());
        };
        for group_id in &rollout.group_ids {
            if !self.assigner.schedule_group(id, *group_id)? {
                debug!(rollout = id, group = group_id, "group scheduling incomplete");
                return Ok(());
            }
        }

        let started = self.store.write(|txn| -> RolloutResult<bool> {
            let mut rollout = txn.require_rollout(id)?;
            if rollout.status != RolloutStatus::Starting {
                return Ok(false);
            }
            let groups = txn.groups(&rollout)?;
            if groups.iter().any(|g| g.status != GroupStatus::Scheduled) {
                return Ok(false);
            }
            let first_id = rollout.first_group().ok_or_else(|| {
                RolloutError::IllegalState(format!("rollout {id} has no groups"))
            })?;
            let mut first = txn.require_group(first_id)?;
            if first.rollout_id != id || rollout.parent_of(first_id).is_some() {
                return Err(RolloutError::IllegalState(format!(
                    "group {first_id} cannot start rollout {id}"
                )));
            }
            let now = epoch_millis();
            activate_group_actions(txn, id, first_id)?;
            first.status = GroupStatus::Running;
            first.updated_at = now;
            txn.put_group(&first)?;

            rollout.status = RolloutStatus::Running;
            rollout.last_check = 0;
            rollout.updated_at = now;
            txn.put_rollout(&rollout)?;
            Ok(true)
        })?;
        if started {
            info!(rollout = id, "rollout running");
        }
        Ok(())
    }

    /// Move a READY rollout to STARTING once its start time has passed.
    pub fn handle_ready(&self, id: RolloutId, now: u64) -> RolloutResult<()> {
        let Some(rollout) = self.load(id, RolloutStatus::Ready)? else {
            return Ok(());
        };
        match rollout.start_at {
            Some(start_at) if start_at <= now => {}
            _ => return Ok(()),
        }

        let starting = self.store.write(|txn| -> RolloutResult<bool> {
            let mut rollout = txn.require_rollout(id)?;
            if rollout.status != RolloutStatus::Ready {
                return Ok(false);
            }
            rollout.status = RolloutStatus::Starting;
            rollout.last_check = 0;
            rollout.updated_at = epoch_millis();
            txn.put_rollout(&rollout)?;
            Ok(true)
        })?;
        if starting {
            info!(rollout = id, "scheduled start reached, rollout starting");
        }
        Ok(())
    }

    /// Evaluate the running groups' conditions and finish the rollout when
    /// no group is left RUNNING or SCHEDULED.
    ///
    /// The whole evaluation is one transaction.
    pub fn handle_running(&self, id: RolloutId) -> RolloutResult<()> {
        if self.load(id, RolloutStatus::Running)?.is_none() {
            return Ok(());
        }
        let finished = self.store.write(|txn| -> RolloutResult<bool> {
            let rollout = txn.require_rollout(id)?;
            if rollout.status != RolloutStatus::Running {
                return Ok(false);
            }
            let groups = txn.groups(&rollout)?;
            let running: Vec<RolloutGroup> = groups
                .iter()
                .filter(|g| g.status == GroupStatus::Running)
                .cloned()
                .collect();

            if running.is_empty() {
                self.recover(txn, &rollout, &groups)?;
            }
            for group in running {
                let rollout = txn.require_rollout(id)?;
                if rollout.status != RolloutStatus::Running {
                    break;
                }
                self.process_group(txn, rollout, group)?;
            }

            let mut rollout = txn.require_rollout(id)?;
            if rollout.status != RolloutStatus::Running {
                return Ok(false);
            }
            let in_flight = txn.groups(&rollout)?.iter().any(|g| {
                matches!(g.status, GroupStatus::Running | GroupStatus::Scheduled)
            });
            if in_flight {
                return Ok(false);
            }
            rollout.status = RolloutStatus::Finished;
            rollout.updated_at = epoch_millis();
            txn.put_rollout(&rollout)?;
            Ok(true)
        })?;
        if finished {
            info!(rollout = id, "rollout finished");
        }
        Ok(())
    }

    /// No group is running: re-run the success action of the latest group
    /// that is not SCHEDULED so the chain can continue.
    fn recover(
        &self,
        txn: &mut StoreTxn<'_>,
        rollout: &Rollout,
        groups: &[RolloutGroup],
    ) -> RolloutResult<()> {
        let Some(latest) = groups
            .iter()
            .rev()
            .find(|g| g.status != GroupStatus::Scheduled)
        else {
            return Ok(());
        };
        debug!(
            rollout = rollout.id,
            group = latest.id,
            status = %latest.status,
            "no running group, re-running success action"
        );
        self.conditions
            .execute(txn, rollout, latest, &latest.conditions.success_action)
    }

    fn process_group(
        &self,
        txn: &mut StoreTxn<'_>,
        mut rollout: Rollout,
        mut group: RolloutGroup,
    ) -> RolloutResult<()> {
        let live = txn.count_members(rollout.id, group.id)?;
        if live != group.total_targets {
            info!(
                rollout = rollout.id,
                group = group.id,
                recorded = group.total_targets,
                live,
                "correcting group target count"
            );
            rollout.total_targets = rollout
                .total_targets
                .saturating_sub(group.total_targets)
                + live;
            group.total_targets = live;
            let now = epoch_millis();
            rollout.updated_at = now;
            group.updated_at = now;
            txn.put_rollout(&rollout)?;
            txn.put_group(&group)?;
        }

        if let Some(condition) = &group.conditions.error_condition
            && self.conditions.evaluate(txn, &rollout, &group, condition)?
        {
            let action = group
                .conditions
                .error_action
                .clone()
                .unwrap_or_else(|| GroupAction::PauseRollout(String::new()));
            info!(rollout = rollout.id, group = group.id, "error condition met");
            return self.conditions.execute(txn, &rollout, &group, &action);
        }

        let conditions = &group.conditions;
        if self
            .conditions
            .evaluate(txn, &rollout, &group, &conditions.success_condition)?
        {
            debug!(rollout = rollout.id, group = group.id, "success condition met");
            self.conditions
                .execute(txn, &rollout, &group, &conditions.success_action)?;
        }

        let unfinished = txn
            .group_actions(rollout.id, group.id)?
            .iter()
            .filter(|a| !a.status.is_terminal())
            .count();
        if unfinished == 0 {
            let mut group = txn.require_group(group.id)?;
            if group.status == GroupStatus::Running {
                group.status = GroupStatus::Finished;
                group.updated_at = epoch_millis();
                txn.put_group(&group)?;
                info!(rollout = rollout.id, group = group.id, "group finished");
            }
        }
        Ok(())
    }
}
