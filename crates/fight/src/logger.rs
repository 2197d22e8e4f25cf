//! Throttled fight warnings.

use std::time::{Duration, Instant};

use tidepool_core::FightKey;
use tracing::warn;

use crate::Sharded;

/// Minimum spacing between two warnings for the same object.
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(60);

pub struct FightLogger {
    last_logged: Sharded<Instant>,
    interval: Duration,
}

impl Default for FightLogger {
    fn default() -> Self { Self::new(DEFAULT_LOG_INTERVAL) }
}

impl FightLogger {
    pub fn new(interval: Duration) -> Self {
        Self { last_logged: Sharded::new(), interval }
    }

    /// Warn about a fight over `key` unless one was logged for it within the
    /// interval. Returns whether a warning was emitted now, so callers can hang
    /// further side effects (events, status) off actual emissions.
    pub fn log_fight(&self, now: Instant, key: &FightKey, heat: f64) -> bool {
        let mut shard = self.last_logged.shard(key);
        if let Some(last) = shard.get(key) {
            if now.saturating_duration_since(*last) < self.interval {
                return false;
            }
        }
        shard.insert(key.clone(), now);
        drop(shard);
        warn!(
            resource = %key,
            updates_per_min = heat,
            "fight detected: another controller may be reverting changes to this resource"
        );
        true
    }
}
