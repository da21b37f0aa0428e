//! fleetroll-state: embedded rollout store.
//!
//! Backed by [redb](https://docs.rs/redb), persists rollouts, their groups,
//! group memberships, deployment actions, and the target/distribution
//! registry the engine reads from.
//!
//! # Architecture
//!
//! Domain records are JSON-serialized into redb's `&[u8]` value columns.
//! Rollouts, groups, actions, and distributions use `u64` keys allocated
//! from a sequence table. Memberships are keyed `{rollout_id}:{target_id}`
//! so a target can hold at most one membership row per rollout.
//!
//! [`StateStore::write`] runs a closure in a fresh write transaction and is
//! the unit of work every batch in the engine is built on. redb serializes
//! writers, which is what makes [`StateStore::claim_rollouts`] an atomic
//! compare-and-set across concurrent scheduler instances sharing a store.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod error;
pub mod store;
pub mod tables;
pub mod txn;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use tables::{ACTION_SEQ, DISTRIBUTION_SEQ, GROUP_SEQ, ROLLOUT_SEQ};
pub use txn::StoreTxn;
pub use types::*;
