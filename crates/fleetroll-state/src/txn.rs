//! StoreTxn: typed access to one open write transaction.
//!
//! Obtained through [`StateStore::write`](crate::StateStore::write). Every
//! read and write made through a `StoreTxn` commits or rolls back together.

use redb::{ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

pub(crate) fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Encode))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Decode))
}

/// Fetch one JSON record from an id-keyed table.
pub(crate) fn get_record<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
    id: u64,
) -> StateResult<Option<T>> {
    match table.get(id).map_err(map_err!(Storage))? {
        Some(guard) => decode(guard.value()).map(Some),
        None => Ok(None),
    }
}

/// Decode every record of an id-keyed table, in id order.
pub(crate) fn all_records<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Storage))? {
        let (_, value) = entry.map_err(map_err!(Storage))?;
        results.push(decode(value.value())?);
    }
    Ok(results)
}

/// Decode every record of a string-keyed table whose key starts with `prefix`.
pub(crate) fn prefixed_records<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Storage))? {
        let (key, value) = entry.map_err(map_err!(Storage))?;
        if key.value().starts_with(prefix) {
            results.push(decode(value.value())?);
        }
    }
    Ok(results)
}

/// An open write transaction with typed record accessors.
pub struct StoreTxn<'a> {
    txn: &'a WriteTransaction,
}

impl<'a> StoreTxn<'a> {
    pub(crate) fn new(txn: &'a WriteTransaction) -> Self {
        Self { txn }
    }

    /// Allocate the next id from a named sequence. Ids start at 1.
    pub fn next_id(&mut self, sequence: &str) -> StateResult<u64> {
        let mut table = self.txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        let current = table
            .get(sequence)
            .map_err(map_err!(Storage))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        let next = current + 1;
        table.insert(sequence, next).map_err(map_err!(Storage))?;
        Ok(next)
    }

    fn put_json(
        &mut self,
        definition: TableDefinition<'static, u64, &'static [u8]>,
        id: u64,
        value: &impl Serialize,
    ) -> StateResult<()> {
        let bytes = encode(value)?;
        let mut table = self.txn.open_table(definition).map_err(map_err!(Table))?;
        table
            .insert(id, bytes.as_slice())
            .map_err(map_err!(Storage))?;
        Ok(())
    }

    // ── Rollouts ───────────────────────────────────────────────────

    pub fn rollout(&self, id: RolloutId) -> StateResult<Option<Rollout>> {
        let table = self.txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        get_record(&table, id)
    }

    pub fn require_rollout(&self, id: RolloutId) -> StateResult<Rollout> {
        self.rollout(id)?
            .ok_or_else(|| StateError::not_found("rollout", id))
    }

    pub fn rollouts(&self) -> StateResult<Vec<Rollout>> {
        let table = self.txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        all_records(&table)
    }

    pub fn rollout_name_taken(&self, name: &str) -> StateResult<bool> {
        Ok(self.rollouts()?.iter().any(|r| r.name == name))
    }

    pub fn put_rollout(&mut self, rollout: &Rollout) -> StateResult<()> {
        self.put_json(ROLLOUTS, rollout.id, rollout)
    }

    /// Stamp `last_check = now` on every rollout in `status` whose last check
    /// is at or before `now - delay_ms`. Returns the number of rows claimed.
    ///
    /// A row already stamped by a concurrent instance no longer satisfies the
    /// staleness predicate, so each rollout is claimed at most once per window.
    pub fn claim_rollouts(
        &mut self,
        status: RolloutStatus,
        now: u64,
        delay_ms: u64,
    ) -> StateResult<usize> {
        let threshold = now.saturating_sub(delay_ms);
        let mut table = self.txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let due: Vec<Rollout> = all_records::<Rollout>(&table)?
            .into_iter()
            .filter(|r| r.status == status && r.last_check <= threshold)
            .collect();
        for mut rollout in due.iter().cloned() {
            rollout.last_check = now;
            let bytes = encode(&rollout)?;
            table
                .insert(rollout.id, bytes.as_slice())
                .map_err(map_err!(Storage))?;
        }
        debug!(%status, now, claimed = due.len(), "claim update applied");
        Ok(due.len())
    }

    // ── Groups ─────────────────────────────────────────────────────

    pub fn group(&self, id: GroupId) -> StateResult<Option<RolloutGroup>> {
        let table = self.txn.open_table(GROUPS).map_err(map_err!(Table))?;
        get_record(&table, id)
    }

    pub fn require_group(&self, id: GroupId) -> StateResult<RolloutGroup> {
        self.group(id)?
            .ok_or_else(|| StateError::not_found("rollout group", id))
    }

    /// The rollout's groups in chain order.
    pub fn groups(&self, rollout: &Rollout) -> StateResult<Vec<RolloutGroup>> {
        let table = self.txn.open_table(GROUPS).map_err(map_err!(Table))?;
        rollout
            .group_ids
            .iter()
            .map(|id| {
                get_record::<RolloutGroup>(&table, *id)?
                    .ok_or_else(|| StateError::not_found("rollout group", id))
            })
            .collect()
    }

    pub fn put_group(&mut self, group: &RolloutGroup) -> StateResult<()> {
        self.put_json(GROUPS, group.id, group)
    }

    // ── Registry ───────────────────────────────────────────────────

    pub fn distribution(&self, id: DistributionId) -> StateResult<Option<Distribution>> {
        let table = self
            .txn
            .open_table(DISTRIBUTIONS)
            .map_err(map_err!(Table))?;
        get_record(&table, id)
    }

    pub fn put_distribution(&mut self, distribution: &Distribution) -> StateResult<()> {
        self.put_json(DISTRIBUTIONS, distribution.id, distribution)
    }

    pub fn put_target(&mut self, target: &Target) -> StateResult<()> {
        let bytes = encode(target)?;
        let mut table = self.txn.open_table(TARGETS).map_err(map_err!(Table))?;
        table
            .insert(target.id.as_str(), bytes.as_slice())
            .map_err(map_err!(Storage))?;
        Ok(())
    }

    /// Remove a target together with its membership rows, cancelling any of
    /// its actions that are still open. Returns true if it existed.
    pub fn remove_target(&mut self, target_id: &str) -> StateResult<bool> {
        let existed = {
            let mut table = self.txn.open_table(TARGETS).map_err(map_err!(Table))?;
            let removed = table.remove(target_id).map_err(map_err!(Storage))?;
            removed.is_some()
        };
        let keys = {
            let mut table = self
                .txn
                .open_table(MEMBERSHIPS)
                .map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(map_err!(Storage))? {
                let (key, value) = entry.map_err(map_err!(Storage))?;
                let membership: GroupMembership = decode(value.value())?;
                if membership.target_id == target_id {
                    keys.push(key.value().to_string());
                }
            }
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Storage))?;
            }
            keys
        };

        // Nothing will ever report on these again.
        let orphaned =
            self.actions_where(|a| a.target_id == target_id && !a.status.is_terminal())?;
        let now = epoch_millis();
        for mut action in orphaned.iter().cloned() {
            action.status = ActionStatus::Canceled;
            action.active = false;
            action.updated_at = now;
            self.put_action(&action)?;
        }
        debug!(
            %target_id,
            existed,
            memberships = keys.len(),
            actions = orphaned.len(),
            "target removed"
        );
        Ok(existed)
    }

    // ── Memberships ────────────────────────────────────────────────

    /// Insert a membership unless the target already belongs to a group of
    /// the same rollout. Returns true if the row was written.
    pub fn insert_membership(&mut self, membership: &GroupMembership) -> StateResult<bool> {
        let key = membership.table_key();
        let bytes = encode(membership)?;
        let mut table = self
            .txn
            .open_table(MEMBERSHIPS)
            .map_err(map_err!(Table))?;
        let exists = table
            .get(key.as_str())
            .map_err(map_err!(Storage))?
            .is_some();
        if exists {
            return Ok(false);
        }
        table
            .insert(key.as_str(), bytes.as_slice())
            .map_err(map_err!(Storage))?;
        Ok(true)
    }

    pub fn memberships(&self, rollout_id: RolloutId) -> StateResult<Vec<GroupMembership>> {
        let table = self
            .txn
            .open_table(MEMBERSHIPS)
            .map_err(map_err!(Table))?;
        prefixed_records(&table, &format!("{rollout_id}:"))
    }

    pub fn group_members(
        &self,
        rollout_id: RolloutId,
        group_id: GroupId,
    ) -> StateResult<Vec<TargetId>> {
        Ok(self
            .memberships(rollout_id)?
            .into_iter()
            .filter(|m| m.group_id == group_id)
            .map(|m| m.target_id)
            .collect())
    }

    pub fn count_members(&self, rollout_id: RolloutId, group_id: GroupId) -> StateResult<u64> {
        Ok(self.group_members(rollout_id, group_id)?.len() as u64)
    }

    // ── Actions ────────────────────────────────────────────────────

    pub fn actions_where(&self, pred: impl Fn(&Action) -> bool) -> StateResult<Vec<Action>> {
        let table = self.txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        Ok(all_records::<Action>(&table)?
            .into_iter()
            .filter(|a| pred(a))
            .collect())
    }

    pub fn group_actions(
        &self,
        rollout_id: RolloutId,
        group_id: GroupId,
    ) -> StateResult<Vec<Action>> {
        self.actions_where(|a| a.rollout_id == rollout_id && a.group_id == group_id)
    }

    pub fn action(&self, id: ActionId) -> StateResult<Option<Action>> {
        let table = self.txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        get_record(&table, id)
    }

    pub fn put_action(&mut self, action: &Action) -> StateResult<()> {
        self.put_json(ACTIONS, action.id, action)
    }
}
