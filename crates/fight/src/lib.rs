//! Tidepool fight detection.
//!
//! Two controllers that disagree about an object keep rewriting it. The
//! [`FightDetector`] estimates each object's mutation rate; the [`FightLogger`]
//! turns detected fights into throttled warnings. A [`FightMonitor`] owns one
//! of each and is shared by every reconcile worker in the process.

#![forbid(unsafe_code)]

use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHasher};
use tidepool_core::FightKey;

pub mod detector;
pub mod logger;

pub use detector::{FightDetector, FightState, DEFAULT_FIGHT_THRESHOLD};
pub use logger::{FightLogger, DEFAULT_LOG_INTERVAL};

const SHARDS: usize = 16;

/// Per-key map split over independently locked shards so that workers touching
/// different objects rarely contend.
pub(crate) struct Sharded<V> {
    shards: Vec<Mutex<FxHashMap<FightKey, V>>>,
}

impl<V> Sharded<V> {
    pub(crate) fn new() -> Self {
        Self { shards: (0..SHARDS).map(|_| Mutex::new(FxHashMap::default())).collect() }
    }

    pub(crate) fn shard(&self, key: &FightKey) -> MutexGuard<'_, FxHashMap<FightKey, V>> {
        let mut h = FxHasher::default();
        key.hash(&mut h);
        let idx = (h.finish() as usize) % self.shards.len();
        // State is a plain number per key; a panicked writer cannot leave it torn.
        self.shards[idx].lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outcome of reporting one mutation to the [`FightMonitor`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FightReport {
    pub heat: f64,
    pub fighting: bool,
    /// A warning was emitted for this report.
    pub logged: bool,
}

/// Process-wide fight state. Build once at startup and share by reference.
pub struct FightMonitor {
    detector: FightDetector,
    logger: FightLogger,
}

impl Default for FightMonitor {
    fn default() -> Self { Self::new(DEFAULT_FIGHT_THRESHOLD, DEFAULT_LOG_INTERVAL) }
}

impl FightMonitor {
    pub fn new(threshold: f64, log_interval: Duration) -> Self {
        Self { detector: FightDetector::new(threshold), logger: FightLogger::new(log_interval) }
    }

    pub fn detector(&self) -> &FightDetector { &self.detector }
    pub fn logger(&self) -> &FightLogger { &self.logger }

    /// Record a successful mutation of `key` at `now`.
    pub fn detect(&self, now: Instant, key: &FightKey) -> FightReport {
        let heat = self.detector.mark_updated(now, key);
        let fighting = self.detector.is_fight(heat);
        let logged = fighting && self.logger.log_fight(now, key, heat);
        if logged {
            metrics::counter!("tidepool_fights_total", 1u64, "kind" => key.group_kind.kind.clone());
        }
        FightReport { heat, fighting, logged }
    }
}
