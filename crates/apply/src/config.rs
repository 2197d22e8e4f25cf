//! Environment-driven settings for the apply engine.

use std::str::FromStr;
use std::time::Duration;

use tidepool_fight::{FightMonitor, DEFAULT_FIGHT_THRESHOLD, DEFAULT_LOG_INTERVAL};
use tracing::warn;

pub const DEFAULT_FIELD_MANAGER: &str = "tidepool";

/// Parse `key` from the environment, falling back to `default` when unset or
/// malformed (malformed values are logged).
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "ignoring malformed setting");
                default
            }
        },
        Err(_) => default,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyConfig {
    /// Field manager recorded on every write.
    pub field_manager: String,
    /// Updates per minute at which a resource counts as fought over.
    pub fight_threshold: f64,
    pub fight_log_interval: Duration,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            fight_threshold: DEFAULT_FIGHT_THRESHOLD,
            fight_log_interval: DEFAULT_LOG_INTERVAL,
        }
    }
}

impl ApplyConfig {
    /// `TIDEPOOL_FIELD_MANAGER`, `TIDEPOOL_FIGHT_THRESHOLD`, `TIDEPOOL_FIGHT_LOG_INTERVAL_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let threshold = env_or("TIDEPOOL_FIGHT_THRESHOLD", d.fight_threshold);
        Self {
            field_manager: env_or("TIDEPOOL_FIELD_MANAGER", d.field_manager),
            fight_threshold: if threshold > 0.0 { threshold } else { d.fight_threshold },
            fight_log_interval: Duration::from_secs(env_or(
                "TIDEPOOL_FIGHT_LOG_INTERVAL_SECS",
                d.fight_log_interval.as_secs(),
            )),
        }
    }

    pub fn fight_monitor(&self) -> FightMonitor {
        FightMonitor::new(self.fight_threshold, self.fight_log_interval)
    }
}
