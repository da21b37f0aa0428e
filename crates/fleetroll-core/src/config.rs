//! fleetroll.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or interpreting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration {value:?} for {field}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FleetrollConfig {
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub rollout: RolloutSettings,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the redb database file.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/fleetroll/fleetroll.redb"),
        }
    }
}

/// Cadence of the claim loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often each job runs (e.g. "10s").
    pub interval: String,
    /// A rollout is only claimable once its last check is older than this.
    pub claim_delay: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: "10s".to_string(),
            claim_delay: "2s".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Result<Duration, ConfigError> {
        let interval = parse_duration(&self.interval).ok_or_else(|| {
            ConfigError::InvalidDuration {
                field: "scheduler.interval",
                value: self.interval.clone(),
            }
        })?;
        if interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "scheduler.interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(interval)
    }

    /// The claim staleness window. Zero is rejected: with no window two
    /// instances ticking in the same millisecond would both claim a rollout.
    pub fn claim_delay(&self) -> Result<Duration, ConfigError> {
        let delay = parse_duration(&self.claim_delay).ok_or_else(|| {
            ConfigError::InvalidDuration {
                field: "scheduler.claim_delay",
                value: self.claim_delay.clone(),
            }
        })?;
        if delay < Duration::from_millis(1) {
            return Err(ConfigError::Invalid {
                field: "scheduler.claim_delay",
                reason: "must be at least 1ms".to_string(),
            });
        }
        Ok(delay)
    }
}

/// Limits and defaults applied by the rollout engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RolloutSettings {
    /// Upper bound of targets handled by one assignment or scheduling transaction.
    pub transaction_batch_size: usize,
    /// Maximum number of groups a rollout may be split into.
    pub max_groups: usize,
    /// Finished-percentage threshold used when a rollout omits its success condition.
    pub default_success_threshold: String,
    /// Error-percentage threshold used when a rollout omits its error condition.
    pub default_error_threshold: Option<String>,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            transaction_batch_size: 1000,
            max_groups: 500,
            default_success_threshold: "50".to_string(),
            default_error_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 8480 }
    }
}

impl FleetrollConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FleetrollConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check the values that cannot be expressed through types alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.interval()?;
        self.scheduler.claim_delay()?;
        if self.rollout.transaction_batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "rollout.transaction_batch_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.rollout.max_groups == 0 {
            return Err(ConfigError::Invalid {
                field: "rollout.max_groups",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Parse a duration string like "500ms", "10s", "5m".
///
/// A bare number is read as seconds. Returns `None` for anything else.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
