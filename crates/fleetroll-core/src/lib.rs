//! fleetroll-core: configuration shared by the fleetroll crates.
//!
//! `fleetroll.toml` drives the store location, the claim loop cadence,
//! rollout batching limits, and the API port. Every field is optional;
//! missing values fall back to the defaults documented on each type.

pub mod config;

pub use config::{
    parse_duration, ApiConfig, ConfigError, FleetrollConfig, RolloutSettings, SchedulerConfig,
    StoreConfig,
};
