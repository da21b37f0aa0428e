//! Group conditions and the actions they trigger.
//!
//! Conditions and actions are dispatched through a [`ConditionRegistry`]
//! keyed by [`ConditionKind`] and [`ActionKind`]. The expression carried by
//! a condition or action is passed to the registered implementation as is.

use std::collections::HashMap;
use std::sync::Arc;

use fleetroll_state::*;
use tracing::{error, info, warn};

use crate::assigner::activate_group_actions;
use crate::error::{RolloutError, RolloutResult};

/// Decides whether a running group satisfies a condition.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(
        &self,
        txn: &StoreTxn<'_>,
        rollout: &Rollout,
        group: &RolloutGroup,
        expression: &str,
    ) -> RolloutResult<bool>;
}

/// Behaviour run when a group condition trips.
pub trait GroupActionHandler: Send + Sync {
    fn execute(
        &self,
        txn: &mut StoreTxn<'_>,
        rollout: &Rollout,
        group: &RolloutGroup,
        expression: &str,
    ) -> RolloutResult<()>;
}

#[derive(Clone)]
pub struct ConditionRegistry {
    evaluators: HashMap<ConditionKind, Arc<dyn ConditionEvaluator>>,
    handlers: HashMap<ActionKind, Arc<dyn GroupActionHandler>>,
}

impl Default for ConditionRegistry {
    fn default() -> Self {
        Self::empty()
            .with_evaluator(ConditionKind::FinishedThreshold, FinishedThreshold)
            .with_evaluator(ConditionKind::ErrorThreshold, ErrorThreshold)
            .with_handler(ActionKind::StartNextGroup, StartNextGroup)
            .with_handler(ActionKind::PauseRollout, PauseRollout)
    }
}

impl ConditionRegistry {
    /// A registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            evaluators: HashMap::new(),
            handlers: HashMap::new(),
        }
    }

    pub fn with_evaluator(
        mut self,
        kind: ConditionKind,
        evaluator: impl ConditionEvaluator + 'static,
    ) -> Self {
        self.evaluators.insert(kind, Arc::new(evaluator));
        self
    }

    pub fn with_handler(mut self, kind: ActionKind, handler: impl GroupActionHandler + 'static) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn evaluate(
        &self,
        txn: &StoreTxn<'_>,
        rollout: &Rollout,
        group: &RolloutGroup,
        condition: &GroupCondition,
    ) -> RolloutResult<bool> {
        let evaluator = self.evaluators.get(&condition.kind()).ok_or_else(|| {
            RolloutError::IllegalState(format!("no evaluator registered for {:?}", condition.kind()))
        })?;
        evaluator.evaluate(txn, rollout, group, condition.expression())
    }

    pub fn execute(
        &self,
        txn: &mut StoreTxn<'_>,
        rollout: &Rollout,
        group: &RolloutGroup,
        action: &GroupAction,
    ) -> RolloutResult<()> {
        let handler = self.handlers.get(&action.kind()).ok_or_else(|| {
            RolloutError::IllegalState(format!("no handler registered for {:?}", action.kind()))
        })?;
        handler.execute(txn, rollout, group, action.expression())
    }
}

/// Parse a threshold expression: `80`, `80%` or `threshold:80`.
pub fn parse_threshold(expression: &str) -> Option<f64> {
    let raw = expression.trim();
    let raw = raw.strip_prefix("threshold:").unwrap_or(raw).trim();
    let raw = raw.strip_suffix('%').unwrap_or(raw).trim();
    raw.parse::<f64>().ok().filter(|t| t.is_finite() && *t >= 0.0)
}

fn threshold_or_log(expression: &str, group: &RolloutGroup) -> Option<f64> {
    let threshold = parse_threshold(expression);
    if threshold.is_none() {
        error!(
            group = group.id,
            expression,
            "unparseable threshold expression, condition treated as not met"
        );
    }
    threshold
}

// ── Evaluators ─────────────────────────────────────────────────────

/// At least `expression` percent of the group's targets finished.
/// An empty group is always finished.
pub struct FinishedThreshold;

impl ConditionEvaluator for FinishedThreshold {
    fn evaluate(
        &self,
        txn: &StoreTxn<'_>,
        rollout: &Rollout,
        group: &RolloutGroup,
        expression: &str,
    ) -> RolloutResult<bool> {
        if group.total_targets == 0 {
            return Ok(true);
        }
        let Some(threshold) = threshold_or_log(expression, group) else {
            return Ok(false);
        };
        let finished = txn
            .group_actions(rollout.id, group.id)?
            .iter()
            .filter(|a| a.status == ActionStatus::Finished)
            .count();
        Ok(finished as f64 * 100.0 / group.total_targets as f64 >= threshold)
    }
}

/// More than `expression` percent of the group's targets errored.
/// An empty group never errors.
pub struct ErrorThreshold;

impl ConditionEvaluator for ErrorThreshold {
    fn evaluate(
        &self,
        txn: &StoreTxn<'_>,
        rollout: &Rollout,
        group: &RolloutGroup,
        expression: &str,
    ) -> RolloutResult<bool> {
        let Some(threshold) = threshold_or_log(expression, group) else {
            return Ok(false);
        };
        if group.total_targets == 0 {
            return Ok(false);
        }
        let errors = txn
            .group_actions(rollout.id, group.id)?
            .iter()
            .filter(|a| a.status == ActionStatus::Error)
            .count();
        Ok(errors as f64 * 100.0 / group.total_targets as f64 > threshold)
    }
}

// ── Handlers ───────────────────────────────────────────────────────

/// Start the group after this one in the chain.
///
/// Only a SCHEDULED or READY successor is started; anything further along
/// is left alone, which makes the handler safe to run on every tick.
pub struct StartNextGroup;

impl GroupActionHandler for StartNextGroup {
    fn execute(
        &self,
        txn: &mut StoreTxn<'_>,
        rollout: &Rollout,
        group: &RolloutGroup,
        _expression: &str,
    ) -> RolloutResult<()> {
        let Some(child_id) = rollout.child_of(group.id) else {
            return Ok(());
        };
        let mut child = txn
            .group(child_id)?
            .ok_or(RolloutError::GroupNotFound(child_id))?;
        if !matches!(child.status, GroupStatus::Scheduled | GroupStatus::Ready) {
            return Ok(());
        }
        let activated = activate_group_actions(txn, rollout.id, child.id)?;
        child.status = GroupStatus::Running;
        child.updated_at = epoch_millis();
        txn.put_group(&child)?;
        info!(
            rollout = rollout.id,
            group = child.id,
            parent = group.id,
            activated,
            "next group started"
        );
        Ok(())
    }
}

/// Mark the group errored and pause the rollout.
pub struct PauseRollout;

impl GroupActionHandler for PauseRollout {
    fn execute(
        &self,
        txn: &mut StoreTxn<'_>,
        rollout: &Rollout,
        group: &RolloutGroup,
        _expression: &str,
    ) -> RolloutResult<()> {
        let now = epoch_millis();
        let mut group = txn
            .group(group.id)?
            .ok_or(RolloutError::GroupNotFound(group.id))?;
        group.status = GroupStatus::Error;
        group.updated_at = now;
        txn.put_group(&group)?;

        let mut rollout = txn
            .rollout(rollout.id)?
            .ok_or(RolloutError::RolloutNotFound(rollout.id))?;
        if rollout.status == RolloutStatus::Running {
            rollout.status = RolloutStatus::Paused;
            rollout.updated_at = now;
            txn.put_rollout(&rollout)?;
        }
        warn!(rollout = rollout.id, group = group.id, "group failed, rollout paused");
        Ok(())
    }
}
