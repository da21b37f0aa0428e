//! Group partitioning.
//!
//! Estimates how many targets each group of a rollout will receive before
//! anything is persisted, correcting for targets matched by more than one
//! group filter and for targets lost to percentage rounding.

use std::collections::HashMap;

use fleetroll_state::GroupConditions;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RolloutError, RolloutResult};
use crate::filter::TargetFilter;
use crate::matcher::TargetMatcher;

/// One requested group of a rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Share of the remaining pool, in (0, 100].
    pub target_percentage: f64,
    /// Refinement ANDed onto the rollout filter.
    #[serde(default)]
    pub target_filter: String,
    /// Overrides the rollout-wide conditions for this group.
    #[serde(default)]
    pub conditions: Option<GroupConditions>,
}

impl GroupDefinition {
    pub fn new(name: impl Into<String>, target_percentage: f64) -> Self {
        Self {
            name: name.into(),
            description: None,
            target_percentage,
            target_filter: String::new(),
            conditions: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.target_filter = filter.into();
        self
    }

    /// `count` groups of equal size: group `i` takes `100 / (count - i)`
    /// percent of what the groups before it left over.
    pub fn evenly(count: usize) -> Vec<Self> {
        (0..count)
            .map(|i| Self::new(format!("group-{}", i + 1), 100.0 / (count - i) as f64))
            .collect()
    }
}

/// Outcome of [`validate_groups`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupsValidation {
    /// Targets matching the rollout filter.
    pub total_targets: u64,
    /// Estimated size of each group, in definition order.
    pub targets_per_group: Vec<u64>,
}

impl GroupsValidation {
    /// Matching targets no group will receive.
    pub fn ungrouped(&self) -> u64 {
        self.total_targets
            .saturating_sub(self.targets_per_group.iter().sum::<u64>())
    }
}

/// `percentage` percent of `pool`, rounded half away from zero.
pub(crate) fn percentage_of(percentage: f64, pool: u64) -> u64 {
    (percentage / 100.0 * pool as f64).round() as u64
}

pub(crate) fn check_percentage(group: &GroupDefinition) -> RolloutResult<()> {
    let p = group.target_percentage;
    if p.is_finite() && p > 0.0 && p <= 100.0 {
        Ok(())
    } else {
        Err(RolloutError::Validation(format!(
            "group `{}` has target percentage {p}, expected a value in (0, 100]",
            group.name
        )))
    }
}

/// Validate `groups` against `base_filter` and estimate each group's size.
///
/// Fails if there are no groups, a percentage is out of range, or the base
/// filter matches nothing.
pub fn validate_groups(
    matcher: &dyn TargetMatcher,
    base_filter: &str,
    groups: &[GroupDefinition],
) -> RolloutResult<GroupsValidation> {
    if groups.is_empty() {
        return Err(RolloutError::Validation(
            "a rollout needs at least one group".to_string(),
        ));
    }
    for group in groups {
        check_percentage(group)?;
    }

    let mut counts = CountCache::new(matcher);
    let total_targets = counts.count(&TargetFilter::query(base_filter))?;
    if total_targets == 0 {
        return Err(RolloutError::Validation(format!(
            "target filter `{base_filter}` matches no targets"
        )));
    }

    let mut previous: Vec<TargetFilter> = Vec::with_capacity(groups.len());
    let mut unused = 0u64;
    let mut targets_per_group = Vec::with_capacity(groups.len());

    for group in groups {
        let filter = TargetFilter::for_group(base_filter, &group.target_filter);
        let in_filter = counts.count(&filter)?;
        let overlapping = if previous.is_empty() {
            0
        } else {
            counts.count(&filter.overlapping_with(&previous))?
        };

        let mut real = in_filter.saturating_sub(overlapping);
        if overlapping > 0 && unused > 0 {
            real += unused;
            unused = 0;
        }
        let assigned = percentage_of(group.target_percentage, real);
        unused += real.saturating_sub(assigned);

        debug!(
            group = %group.name,
            in_filter,
            overlapping,
            real,
            assigned,
            "group estimate"
        );
        targets_per_group.push(assigned);
        previous.push(filter);
    }

    Ok(GroupsValidation {
        total_targets,
        targets_per_group,
    })
}

/// Counts memoized by canonical filter rendering for one validation pass.
struct CountCache<'a> {
    matcher: &'a dyn TargetMatcher,
    counts: HashMap<String, u64>,
}

impl<'a> CountCache<'a> {
    fn new(matcher: &'a dyn TargetMatcher) -> Self {
        Self {
            matcher,
            counts: HashMap::new(),
        }
    }

    fn count(&mut self, filter: &TargetFilter) -> RolloutResult<u64> {
        let key = filter.to_string();
        if let Some(count) = self.counts.get(&key) {
            return Ok(*count);
        }
        let count = self.matcher.count_matching(filter)?;
        self.counts.insert(key, count);
        Ok(count)
    }
}
