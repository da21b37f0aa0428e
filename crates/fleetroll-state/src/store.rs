//! StateStore: redb-backed persistence for rollouts.
//!
//! Read accessors open their own read transaction and see the last
//! committed state. Mutations go through [`StateStore::write`], which hands
//! a [`StoreTxn`] to a closure and commits only if the closure succeeds.
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::txn::{all_records, decode, get_record, prefixed_records, StoreTxn};
use crate::types::*;

/// Thread-safe rollout store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(GROUPS).map_err(map_err!(Table))?;
        txn.open_table(MEMBERSHIPS).map_err(map_err!(Table))?;
        txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        txn.open_table(TARGETS).map_err(map_err!(Table))?;
        txn.open_table(DISTRIBUTIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` inside a new, independent write transaction.
    ///
    /// Commits when `f` returns `Ok`; rolls back everything `f` wrote when it
    /// returns `Err`. Must not be called from inside another `write` closure:
    /// redb admits one writer at a time.
    pub fn write<T, E>(&self, f: impl FnOnce(&mut StoreTxn<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = {
            let mut store_txn = StoreTxn::new(&txn);
            f(&mut store_txn)
        };
        match result {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = txn.abort() {
                    warn!(error = %abort, "failed to abort transaction");
                }
                Err(e)
            }
        }
    }

    // ── Claiming ───────────────────────────────────────────────────

    /// Atomically stamp every stale rollout in `status` with `now`.
    ///
    /// Equivalent to `UPDATE rollouts SET last_check = now WHERE status = S
    /// AND last_check <= now - delay`; returns the affected row count.
    pub fn claim_rollouts(
        &self,
        status: RolloutStatus,
        now: u64,
        delay_ms: u64,
    ) -> StateResult<usize> {
        self.write(|txn| txn.claim_rollouts(status, now, delay_ms))
    }

    /// Rollouts in `status` whose last check equals `stamp`, i.e. the batch
    /// claimed by the instance that wrote that stamp.
    pub fn rollouts_checked_at(
        &self,
        status: RolloutStatus,
        stamp: u64,
    ) -> StateResult<Vec<Rollout>> {
        Ok(self
            .list_rollouts()?
            .into_iter()
            .filter(|r| r.status == status && r.last_check == stamp)
            .collect())
    }

    // ── Rollouts ───────────────────────────────────────────────────

    pub fn get_rollout(&self, id: RolloutId) -> StateResult<Option<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        get_record(&table, id)
    }

    pub fn list_rollouts(&self) -> StateResult<Vec<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        all_records(&table)
    }

    // ── Groups ─────────────────────────────────────────────────────

    pub fn get_group(&self, id: GroupId) -> StateResult<Option<RolloutGroup>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        get_record(&table, id)
    }

    /// Groups of a rollout in chain order.
    pub fn list_groups(&self, rollout: &Rollout) -> StateResult<Vec<RolloutGroup>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        let mut groups = Vec::with_capacity(rollout.group_ids.len());
        for id in &rollout.group_ids {
            let group = get_record::<RolloutGroup>(&table, *id)?
                .ok_or_else(|| StateError::not_found("rollout group", id))?;
            groups.push(group);
        }
        Ok(groups)
    }

    // ── Memberships ────────────────────────────────────────────────

    pub fn list_memberships(&self, rollout_id: RolloutId) -> StateResult<Vec<GroupMembership>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MEMBERSHIPS).map_err(map_err!(Table))?;
        prefixed_records(&table, &format!("{rollout_id}:"))
    }

    pub fn count_members(&self, rollout_id: RolloutId, group_id: GroupId) -> StateResult<u64> {
        Ok(self
            .list_memberships(rollout_id)?
            .iter()
            .filter(|m| m.group_id == group_id)
            .count() as u64)
    }

    /// Ids of targets that are members of any of `group_ids`.
    pub fn grouped_target_ids(&self, group_ids: &[GroupId]) -> StateResult<HashSet<TargetId>> {
        if group_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MEMBERSHIPS).map_err(map_err!(Table))?;
        let mut ids = HashSet::new();
        for entry in table.iter().map_err(map_err!(Storage))? {
            let (_, value) = entry.map_err(map_err!(Storage))?;
            let membership: GroupMembership = decode(value.value())?;
            if group_ids.contains(&membership.group_id) {
                ids.insert(membership.target_id);
            }
        }
        Ok(ids)
    }

    // ── Actions ────────────────────────────────────────────────────

    pub fn get_action(&self, id: ActionId) -> StateResult<Option<Action>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        get_record(&table, id)
    }

    pub fn list_actions_for_rollout(&self, rollout_id: RolloutId) -> StateResult<Vec<Action>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        Ok(all_records::<Action>(&table)?
            .into_iter()
            .filter(|a| a.rollout_id == rollout_id)
            .collect())
    }

    pub fn count_actions(&self, rollout_id: RolloutId, group_id: GroupId) -> StateResult<u64> {
        Ok(self
            .list_actions_for_rollout(rollout_id)?
            .iter()
            .filter(|a| a.group_id == group_id)
            .count() as u64)
    }

    /// Record progress reported for an action. Terminal statuses deactivate it.
    ///
    /// An action that already reached a terminal status keeps it; reporting
    /// anything else for it is a `Conflict`. Repeating the same terminal
    /// status is accepted.
    pub fn update_action_status(&self, id: ActionId, status: ActionStatus) -> StateResult<Action> {
        self.write(|txn| {
            let mut action = txn
                .action(id)?
                .ok_or_else(|| StateError::not_found("action", id))?;
            if action.status.is_terminal() {
                if action.status == status {
                    return Ok(action);
                }
                return Err(StateError::Conflict(format!(
                    "action {id} is already {:?}",
                    action.status
                )));
            }
            action.status = status;
            if status.is_terminal() {
                action.active = false;
            }
            action.updated_at = epoch_millis();
            txn.put_action(&action)?;
            debug!(action = id, ?status, "action status updated");
            Ok(action)
        })
    }

    // ── Targets ────────────────────────────────────────────────────

    /// Insert or update a target.
    pub fn put_target(&self, target: &Target) -> StateResult<()> {
        self.write(|txn| txn.put_target(target))?;
        debug!(target = %target.id, "target stored");
        Ok(())
    }

    pub fn get_target(&self, id: &str) -> StateResult<Option<Target>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Storage))? {
            Some(guard) => decode(guard.value()).map(Some),
            None => Ok(None),
        }
    }

    /// All targets in id order.
    pub fn list_targets(&self) -> StateResult<Vec<Target>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
        prefixed_records(&table, "")
    }

    /// Delete a target and its group memberships. Returns true if it existed.
    pub fn delete_target(&self, id: &str) -> StateResult<bool> {
        self.write(|txn| txn.remove_target(id))
    }

    // ── Distributions ──────────────────────────────────────────────

    pub fn create_distribution(&self, name: &str, version: &str) -> StateResult<Distribution> {
        self.write(|txn| {
            let distribution = Distribution {
                id: txn.next_id(DISTRIBUTION_SEQ)?,
                name: name.to_string(),
                version: version.to_string(),
                created_at: epoch_millis(),
            };
            txn.put_distribution(&distribution)?;
            Ok(distribution)
        })
    }

    pub fn get_distribution(&self, id: DistributionId) -> StateResult<Option<Distribution>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DISTRIBUTIONS).map_err(map_err!(Table))?;
        get_record(&table, id)
    }

    pub fn list_distributions(&self) -> StateResult<Vec<Distribution>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DISTRIBUTIONS).map_err(map_err!(Table))?;
        all_records(&table)
    }
}
