//! Rollout manager: caller-facing rollout operations.
//!
//! Creation validates everything up front and persists the rollout with
//! all its groups in a single transaction. Nothing is written when
//! validation fails. Lifecycle requests (start, pause, resume) are status
//! checks followed by a single-row update; the scheduler does the rest.

use std::sync::Arc;

use fleetroll_core::RolloutSettings;
use fleetroll_state::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RolloutError, RolloutResult};
use crate::executor::RolloutExecutor;
use crate::matcher::{parse_query, TargetMatcher};
use crate::partition::{self, GroupDefinition, GroupsValidation};

/// How a new rollout is split into groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupLayout {
    /// `n` equally sized groups over the whole filter.
    Count(usize),
    /// Explicit groups in chain order.
    Definitions(Vec<GroupDefinition>),
}

/// Request to create a rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRollout {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub distribution_id: DistributionId,
    pub target_filter: String,
    #[serde(default)]
    pub action_type: ActionType,
    #[serde(default)]
    pub forced_time: u64,
    #[serde(default)]
    pub start_at: Option<u64>,
    pub groups: GroupLayout,
    /// Conditions for groups that carry none of their own.
    #[serde(default)]
    pub conditions: Option<GroupConditions>,
}

impl CreateRollout {
    pub fn new(
        name: impl Into<String>,
        distribution_id: DistributionId,
        target_filter: impl Into<String>,
        groups: GroupLayout,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            distribution_id,
            target_filter: target_filter.into(),
            action_type: ActionType::default(),
            forced_time: 0,
            start_at: None,
            groups,
            conditions: None,
        }
    }

    pub fn with_conditions(mut self, conditions: GroupConditions) -> Self {
        self.conditions = Some(conditions);
        self
    }
}

/// Action counts by outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCounts {
    pub scheduled: u64,
    pub running: u64,
    pub finished: u64,
    pub error: u64,
    pub canceled: u64,
}

impl ActionCounts {
    fn record(&mut self, status: ActionStatus) {
        match status {
            ActionStatus::Scheduled => self.scheduled += 1,
            ActionStatus::Finished => self.finished += 1,
            ActionStatus::Error => self.error += 1,
            ActionStatus::Canceled => self.canceled += 1,
            ActionStatus::Running
            | ActionStatus::Retrieved
            | ActionStatus::Downloading
            | ActionStatus::Downloaded
            | ActionStatus::Warning
            | ActionStatus::Canceling => self.running += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.scheduled + self.running + self.finished + self.error + self.canceled
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupProgress {
    pub group_id: GroupId,
    pub name: String,
    pub status: GroupStatus,
    pub total_targets: u64,
    pub actions: ActionCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutProgress {
    pub rollout_id: RolloutId,
    pub status: RolloutStatus,
    pub total_targets: u64,
    /// Matched at creation but not (yet) in any group.
    pub unassigned_targets: u64,
    pub actions: ActionCounts,
    pub groups: Vec<GroupProgress>,
}

#[derive(Clone)]
pub struct RolloutManager {
    store: StateStore,
    matcher: Arc<dyn TargetMatcher>,
    settings: RolloutSettings,
}

impl RolloutManager {
    pub fn new(store: StateStore, matcher: Arc<dyn TargetMatcher>, settings: RolloutSettings) -> Self {
        Self {
            store,
            matcher,
            settings,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// An executor over the same store and matcher, assigning and
    /// scheduling in batches of `transaction_batch_size`.
    pub fn executor(&self) -> RolloutExecutor {
        RolloutExecutor::new(
            self.store.clone(),
            self.matcher.clone(),
            self.settings.transaction_batch_size,
        )
    }

    fn default_conditions(&self) -> GroupConditions {
        let conditions =
            GroupConditions::finished_threshold(self.settings.default_success_threshold.clone());
        match &self.settings.default_error_threshold {
            Some(threshold) => conditions.with_error_threshold(threshold.clone()),
            None => conditions,
        }
    }

    fn definitions(&self, layout: &GroupLayout) -> RolloutResult<Vec<GroupDefinition>> {
        let definitions = match layout {
            GroupLayout::Count(0) => {
                return Err(RolloutError::Validation(
                    "a rollout needs at least one group".to_string(),
                ));
            }
            GroupLayout::Count(n) => {
                self.check_group_count(*n)?;
                GroupDefinition::evenly(*n)
            }
            GroupLayout::Definitions(defs) => {
                self.check_group_count(defs.len())?;
                defs.clone()
            }
        };
        Ok(definitions)
    }

    fn check_group_count(&self, count: usize) -> RolloutResult<()> {
        if count > self.settings.max_groups {
            return Err(RolloutError::Validation(format!(
                "{count} groups requested, at most {} allowed",
                self.settings.max_groups
            )));
        }
        Ok(())
    }

    /// Validate a group layout against `target_filter` without creating anything.
    pub fn validate_groups(
        &self,
        target_filter: &str,
        layout: &GroupLayout,
    ) -> RolloutResult<GroupsValidation> {
        let definitions = self.definitions(layout)?;
        check_filters(target_filter, &definitions)?;
        partition::validate_groups(self.matcher.as_ref(), target_filter, &definitions)
    }

    /// Create a rollout in CREATING with all its groups in CREATING.
    pub fn create_rollout(&self, request: CreateRollout) -> RolloutResult<Rollout> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(RolloutError::Validation("rollout name must not be blank".to_string()));
        }
        let definitions = self.definitions(&request.groups)?;
        check_filters(&request.target_filter, &definitions)?;

        let shared = request
            .conditions
            .clone()
            .unwrap_or_else(|| self.default_conditions());
        let conditions = definitions
            .iter()
            .map(|d| complete_conditions(d.conditions.clone().unwrap_or_else(|| shared.clone())))
            .collect::<RolloutResult<Vec<_>>>()?;

        let validation = partition::validate_groups(
            self.matcher.as_ref(),
            &request.target_filter,
            &definitions,
        )?;

        let rollout = self.store.write(|txn| -> RolloutResult<Rollout> {
            if txn.distribution(request.distribution_id)?.is_none() {
                return Err(RolloutError::DistributionNotFound(request.distribution_id));
            }
            if txn.rollout_name_taken(&name)? {
                return Err(RolloutError::Validation(format!(
                    "a rollout named `{name}` already exists"
                )));
            }

            let now = epoch_millis();
            let rollout_id = txn.next_id(ROLLOUT_SEQ)?;
            let mut group_ids = Vec::with_capacity(definitions.len());
            for (definition, conditions) in definitions.iter().zip(conditions) {
                let group = RolloutGroup {
                    id: txn.next_id(GROUP_SEQ)?,
                    rollout_id,
                    name: definition.name.clone(),
                    description: definition.description.clone(),
                    status: GroupStatus::Creating,
                    target_percentage: definition.target_percentage,
                    target_filter: definition.target_filter.trim().to_string(),
                    total_targets: 0,
                    conditions,
                    created_at: now,
                    updated_at: now,
                };
                txn.put_group(&group)?;
                group_ids.push(group.id);
            }

            let rollout = Rollout {
                id: rollout_id,
                name: name.clone(),
                description: request.description.clone(),
                distribution_id: request.distribution_id,
                target_filter: request.target_filter.trim().to_string(),
                action_type: request.action_type,
                forced_time: request.forced_time,
                start_at: request.start_at,
                status: RolloutStatus::Creating,
                total_targets: validation.total_targets,
                group_ids,
                last_check: 0,
                created_at: now,
                updated_at: now,
            };
            txn.put_rollout(&rollout)?;
            Ok(rollout)
        })?;

        info!(
            rollout = rollout.id,
            name = %rollout.name,
            groups = rollout.group_ids.len(),
            total_targets = rollout.total_targets,
            "rollout created"
        );
        Ok(rollout)
    }

    /// READY → STARTING.
    pub fn start(&self, id: RolloutId) -> RolloutResult<Rollout> {
        self.transition(id, RolloutStatus::Ready, RolloutStatus::Starting)
    }

    /// RUNNING → PAUSED. Groups and actions already in flight are not touched.
    pub fn pause(&self, id: RolloutId) -> RolloutResult<Rollout> {
        self.transition(id, RolloutStatus::Running, RolloutStatus::Paused)
    }

    /// PAUSED → RUNNING.
    pub fn resume(&self, id: RolloutId) -> RolloutResult<Rollout> {
        self.transition(id, RolloutStatus::Paused, RolloutStatus::Running)
    }

    fn transition(
        &self,
        id: RolloutId,
        from: RolloutStatus,
        to: RolloutStatus,
    ) -> RolloutResult<Rollout> {
        let rollout = self.store.write(|txn| -> RolloutResult<Rollout> {
            let mut rollout = txn.rollout(id)?.ok_or(RolloutError::RolloutNotFound(id))?;
            if rollout.status != from {
                return Err(RolloutError::IllegalState(format!(
                    "rollout {id} is {}, expected {from}",
                    rollout.status
                )));
            }
            rollout.status = to;
            rollout.last_check = 0;
            rollout.updated_at = epoch_millis();
            txn.put_rollout(&rollout)?;
            Ok(rollout)
        })?;
        info!(rollout = id, %from, %to, "rollout status changed");
        Ok(rollout)
    }

    pub fn get_rollout(&self, id: RolloutId) -> RolloutResult<Rollout> {
        self.store
            .get_rollout(id)?
            .ok_or(RolloutError::RolloutNotFound(id))
    }

    pub fn list_rollouts(&self) -> RolloutResult<Vec<Rollout>> {
        Ok(self.store.list_rollouts()?)
    }

    /// The rollout's groups in chain order.
    pub fn groups(&self, id: RolloutId) -> RolloutResult<Vec<RolloutGroup>> {
        let rollout = self.get_rollout(id)?;
        Ok(self.store.list_groups(&rollout)?)
    }

    pub fn progress(&self, id: RolloutId) -> RolloutResult<RolloutProgress> {
        let rollout = self.get_rollout(id)?;
        let groups = self.store.list_groups(&rollout)?;
        let actions = self.store.list_actions_for_rollout(id)?;
        let assigned = self.store.list_memberships(id)?.len() as u64;

        let mut totals = ActionCounts::default();
        let mut per_group = Vec::with_capacity(groups.len());
        for group in groups {
            let mut counts = ActionCounts::default();
            for action in actions.iter().filter(|a| a.group_id == group.id) {
                counts.record(action.status);
                totals.record(action.status);
            }
            per_group.push(GroupProgress {
                group_id: group.id,
                name: group.name,
                status: group.status,
                total_targets: group.total_targets,
                actions: counts,
            });
        }

        Ok(RolloutProgress {
            rollout_id: id,
            status: rollout.status,
            total_targets: rollout.total_targets,
            unassigned_targets: rollout.total_targets.saturating_sub(assigned),
            actions: totals,
            groups: per_group,
        })
    }
}

fn check_filters(base: &str, definitions: &[GroupDefinition]) -> RolloutResult<()> {
    parse_query(base)?;
    for definition in definitions {
        if definition.name.trim().is_empty() {
            return Err(RolloutError::Validation("group name must not be blank".to_string()));
        }
        parse_query(&definition.target_filter)?;
    }
    Ok(())
}

/// An error condition without an action pauses the rollout; an error action
/// without a condition is rejected.
fn complete_conditions(mut conditions: GroupConditions) -> RolloutResult<GroupConditions> {
    match (&conditions.error_condition, &conditions.error_action) {
        (Some(_), None) => conditions.error_action = Some(GroupAction::PauseRollout(String::new())),
        (None, Some(_)) => {
            return Err(RolloutError::Validation(
                "error action configured without an error condition".to_string(),
            ));
        }
        _ => {}
    }
    Ok(conditions)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::filter::TargetFilter;
    use crate::matcher::{MatchError, StoreTargetMatcher};

    fn setup(targets: usize) -> (RolloutManager, DistributionId) {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..targets {
            store.put_target(&Target::new(format!("t-{i:03}"))).unwrap();
        }
        let distribution = store.create_distribution("firmware", "2.0").unwrap();
        let matcher = Arc::new(StoreTargetMatcher::new(store.clone()));
        let manager = RolloutManager::new(store, matcher, RolloutSettings::default());
        (manager, distribution.id)
    }

    fn set_status(manager: &RolloutManager, id: RolloutId, status: RolloutStatus) {
        manager
            .store()
            .write(|txn| -> StateResult<()> {
                let mut rollout = txn.require_rollout(id)?;
                rollout.status = status;
                txn.put_rollout(&rollout)
            })
            .unwrap();
    }

    #[test]
    fn create_persists_rollout_and_groups() {
        let (manager, dist) = setup(20);
        let rollout = manager
            .create_rollout(CreateRollout::new("fw-2.0", dist, "*", GroupLayout::Count(3)))
            .unwrap();

        assert_eq!(rollout.status, RolloutStatus::Creating);
        assert_eq!(rollout.total_targets, 20);
        assert_eq!(rollout.group_ids.len(), 3);

        let groups = manager.groups(rollout.id).unwrap();
        let names: Vec<_> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["group-1", "group-2", "group-3"]);
        assert!((groups[0].target_percentage - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(groups[2].target_percentage, 100.0);
        assert!(groups.iter().all(|g| g.status == GroupStatus::Creating));
        assert_eq!(
            groups[0].conditions,
            GroupConditions::finished_threshold("50")
        );
    }

    #[test]
    fn zero_matching_targets_persists_nothing() {
        let (manager, dist) = setup(0);
        let err = manager
            .create_rollout(CreateRollout::new("empty", dist, "*", GroupLayout::Count(2)))
            .unwrap_err();
        assert!(matches!(err, RolloutError::Validation(_)));
        assert!(manager.list_rollouts().unwrap().is_empty());
    }

    #[test]
    fn rejects_invalid_requests() {
        let (manager, dist) = setup(5);
        let cases = vec![
            CreateRollout::new("  ", dist, "*", GroupLayout::Count(1)),
            CreateRollout::new("none", dist, "*", GroupLayout::Count(0)),
            CreateRollout::new("too-many", dist, "*", GroupLayout::Count(501)),
            CreateRollout::new("absurd", dist, "*", GroupLayout::Count(usize::MAX)),
            CreateRollout::new(
                "bad-pct",
                dist,
                "*",
                GroupLayout::Definitions(vec![GroupDefinition::new("g", 120.0)]),
            ),
            CreateRollout::new(
                "blank-group",
                dist,
                "*",
                GroupLayout::Definitions(vec![GroupDefinition::new(" ", 50.0)]),
            ),
        ];
        for request in cases {
            let name = request.name.clone();
            assert!(
                matches!(manager.create_rollout(request), Err(RolloutError::Validation(_))),
                "{name:?} should be rejected"
            );
        }

        let orphan_action = GroupConditions {
            error_action: Some(GroupAction::PauseRollout(String::new())),
            ..GroupConditions::finished_threshold("50")
        };
        let err = manager
            .create_rollout(
                CreateRollout::new("orphan", dist, "*", GroupLayout::Count(1))
                    .with_conditions(orphan_action),
            )
            .unwrap_err();
        assert!(matches!(err, RolloutError::Validation(_)));

        let err = manager
            .create_rollout(CreateRollout::new("q", dist, "region=eu", GroupLayout::Count(1)))
            .unwrap_err();
        assert!(matches!(err, RolloutError::Matcher(MatchError::InvalidQuery { .. })));
        assert!(manager.list_rollouts().unwrap().is_empty());
    }

    #[test]
    fn names_are_unique() {
        let (manager, dist) = setup(5);
        manager
            .create_rollout(CreateRollout::new("fw", dist, "*", GroupLayout::Count(1)))
            .unwrap();
        let err = manager
            .create_rollout(CreateRollout::new("fw", dist, "*", GroupLayout::Count(1)))
            .unwrap_err();
        assert!(matches!(err, RolloutError::Validation(_)));
        assert_eq!(manager.list_rollouts().unwrap().len(), 1);
    }

    #[test]
    fn unknown_distribution_is_not_found() {
        let (manager, _) = setup(5);
        let err = manager
            .create_rollout(CreateRollout::new("fw", 42, "*", GroupLayout::Count(1)))
            .unwrap_err();
        assert!(matches!(err, RolloutError::DistributionNotFound(42)));
    }

    #[test]
    fn error_condition_defaults_to_pause() {
        let (manager, dist) = setup(5);
        let conditions = GroupConditions {
            error_condition: Some(GroupCondition::ErrorThreshold("10".to_string())),
            ..GroupConditions::finished_threshold("80")
        };
        let rollout = manager
            .create_rollout(
                CreateRollout::new("fw", dist, "*", GroupLayout::Count(2)).with_conditions(conditions),
            )
            .unwrap();
        let groups = manager.groups(rollout.id).unwrap();
        assert_eq!(
            groups[1].conditions.error_action,
            Some(GroupAction::PauseRollout(String::new()))
        );
    }

    #[test]
    fn lifecycle_requests_check_status() {
        let (manager, dist) = setup(5);
        let rollout = manager
            .create_rollout(CreateRollout::new("fw", dist, "*", GroupLayout::Count(1)))
            .unwrap();
        let id = rollout.id;

        assert!(matches!(manager.start(id), Err(RolloutError::IllegalState(_))));
        assert!(matches!(manager.pause(id), Err(RolloutError::IllegalState(_))));
        assert!(matches!(manager.resume(id), Err(RolloutError::IllegalState(_))));

        set_status(&manager, id, RolloutStatus::Ready);
        assert_eq!(manager.start(id).unwrap().status, RolloutStatus::Starting);
        assert!(matches!(manager.start(id), Err(RolloutError::IllegalState(_))));

        set_status(&manager, id, RolloutStatus::Running);
        assert_eq!(manager.pause(id).unwrap().status, RolloutStatus::Paused);
        assert!(matches!(manager.pause(id), Err(RolloutError::IllegalState(_))));
        assert_eq!(manager.resume(id).unwrap().status, RolloutStatus::Running);

        assert!(matches!(manager.start(999), Err(RolloutError::RolloutNotFound(999))));
    }

    /// Counts the pages requested from the store matcher.
    struct CountingPages {
        inner: StoreTargetMatcher,
        pages: AtomicUsize,
    }

    impl TargetMatcher for CountingPages {
        fn count_matching(&self, filter: &TargetFilter) -> Result<u64, MatchError> {
            self.inner.count_matching(filter)
        }

        fn count_matching_excluding(
            &self,
            filter: &TargetFilter,
            excluded: &[GroupId],
        ) -> Result<u64, MatchError> {
            self.inner.count_matching_excluding(filter, excluded)
        }

        fn page_matching_excluding(
            &self,
            filter: &TargetFilter,
            excluded: &[GroupId],
            offset: usize,
            limit: usize,
        ) -> Result<Vec<TargetId>, MatchError> {
            self.pages.fetch_add(1, Ordering::SeqCst);
            self.inner.page_matching_excluding(filter, excluded, offset, limit)
        }
    }

    #[test]
    fn executor_uses_configured_batch_size() {
        let (plain, dist) = setup(5);
        let store = plain.store().clone();
        let matcher = Arc::new(CountingPages {
            inner: StoreTargetMatcher::new(store.clone()),
            pages: AtomicUsize::new(0),
        });
        let settings = RolloutSettings {
            transaction_batch_size: 2,
            ..RolloutSettings::default()
        };
        let manager = RolloutManager::new(store, matcher.clone(), settings);
        let rollout = manager
            .create_rollout(CreateRollout::new("batched", dist, "*", GroupLayout::Count(1)))
            .unwrap();

        manager.executor().handle_creating(rollout.id).unwrap();

        assert_eq!(manager.get_rollout(rollout.id).unwrap().status, RolloutStatus::Ready);
        // 5 targets in batches of 2.
        assert_eq!(matcher.pages.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn validate_reports_estimates() {
        let (manager, _) = setup(100);
        let v = manager.validate_groups("*", &GroupLayout::Count(4)).unwrap();
        assert_eq!(v.total_targets, 100);
        assert_eq!(v.targets_per_group, vec![25, 25, 25, 25]);
        assert!(manager.list_rollouts().unwrap().is_empty());

        assert!(matches!(
            manager.validate_groups("*", &GroupLayout::Count(usize::MAX)),
            Err(RolloutError::Validation(_))
        ));
    }

    #[test]
    fn progress_buckets_action_statuses() {
        let (manager, dist) = setup(4);
        let rollout = manager
            .create_rollout(CreateRollout::new("fw", dist, "*", GroupLayout::Count(1)))
            .unwrap();
        let group_id = rollout.group_ids[0];
        manager
            .store()
            .write(|txn| -> StateResult<()> {
                for (i, status) in [
                    ActionStatus::Finished,
                    ActionStatus::Downloading,
                    ActionStatus::Error,
                ]
                .into_iter()
                .enumerate()
                {
                    let target_id = format!("t-{i:03}");
                    txn.insert_membership(&GroupMembership {
                        rollout_id: rollout.id,
                        group_id,
                        target_id: target_id.clone(),
                        assigned_at: 0,
                    })?;
                    txn.put_action(&Action {
                        id: i as u64 + 1,
                        target_id,
                        distribution_id: dist,
                        status,
                        action_type: ActionType::Forced,
                        forced_time: 0,
                        rollout_id: rollout.id,
                        group_id,
                        active: false,
                        created_at: 0,
                        updated_at: 0,
                    })?;
                }
                Ok(())
            })
            .unwrap();

        let progress = manager.progress(rollout.id).unwrap();
        assert_eq!(progress.unassigned_targets, 1);
        assert_eq!(progress.actions.finished, 1);
        assert_eq!(progress.actions.running, 1);
        assert_eq!(progress.actions.error, 1);
        assert_eq!(progress.actions.total(), 3);
        assert_eq!(progress.groups[0].actions, progress.actions);
    }
}
