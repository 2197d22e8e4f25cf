//! Mutation-rate estimation with one decaying scalar per object.

use std::time::{Duration, Instant};

use tidepool_core::FightKey;

use crate::Sharded;

/// Updates per minute above which two controllers are assumed to be fighting.
pub const DEFAULT_FIGHT_THRESHOLD: f64 = 5.0;

/// Heat decays by a factor of e per this period.
const DECAY_PERIOD: Duration = Duration::from_secs(60);

/// Heat of one object: roughly its recent updates per minute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FightState {
    pub heat: f64,
    pub last: Instant,
}

impl FightState {
    pub fn new(now: Instant) -> Self {
        Self { heat: 0.0, last: now }
    }

    /// Decay the heat for the time since the previous update, then count this one.
    /// Simultaneous updates do not decay at all.
    pub fn mark_updated(&mut self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last);
        self.heat = self.heat * (-elapsed.as_secs_f64() / DECAY_PERIOD.as_secs_f64()).exp() + 1.0;
        if now > self.last {
            self.last = now;
        }
        self.heat
    }
}

/// Tracks [`FightState`] for every object mutated by this process.
/// Entries are created on first update and kept for the process lifetime.
pub struct FightDetector {
    states: Sharded<FightState>,
    threshold: f64,
}

impl Default for FightDetector {
    fn default() -> Self { Self::new(DEFAULT_FIGHT_THRESHOLD) }
}

impl FightDetector {
    pub fn new(threshold: f64) -> Self {
        Self { states: Sharded::new(), threshold }
    }

    pub fn threshold(&self) -> f64 { self.threshold }

    pub fn is_fight(&self, heat: f64) -> bool { heat >= self.threshold }

    /// Record that `key` was updated at `now`; returns its new heat.
    pub fn mark_updated(&self, now: Instant, key: &FightKey) -> f64 {
        let mut shard = self.states.shard(key);
        shard.entry(key.clone()).or_insert_with(|| FightState::new(now)).mark_updated(now)
    }

    pub fn heat(&self, key: &FightKey) -> Option<f64> {
        self.states.shard(key).get(key).map(|s| s.heat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FightKey {
        FightKey::new("apps", "Deployment", Some("shop"), "web")
    }

    /// Feed `n` updates spaced `every` apart; returns the heat after each.
    fn run(state: &mut FightState, start: Instant, every: Duration, n: u32) -> Vec<f64> {
        (0..n).map(|i| state.mark_updated(start + every * i)).collect()
    }

    #[test]
    fn small_simultaneous_burst_stays_below_threshold() {
        let d = FightDetector::default();
        let now = Instant::now();
        let heats: Vec<f64> = (0..4).map(|_| d.mark_updated(now, &key())).collect();
        assert!(heats.iter().all(|h| !d.is_fight(*h)), "heats={:?}", heats);
    }

    #[test]
    fn large_simultaneous_burst_is_a_fight() {
        let d = FightDetector::default();
        let now = Instant::now();
        let mut last = 0.0;
        for _ in 0..6 {
            last = d.mark_updated(now, &key());
        }
        assert!(d.is_fight(last), "heat={}", last);
    }

    #[test]
    fn eight_per_minute_triggers_within_a_minute() {
        let t0 = Instant::now();
        let mut s = FightState::new(t0);
        // every 7.5s, all inside the first minute
        let heats = run(&mut s, t0, Duration::from_millis(7_500), 8);
        assert!(heats.iter().any(|h| *h >= DEFAULT_FIGHT_THRESHOLD), "heats={:?}", heats);
    }

    #[test]
    fn seven_per_minute_does_not_trigger_within_a_minute() {
        let t0 = Instant::now();
        let mut s = FightState::new(t0);
        let every = Duration::from_secs(60) / 7;
        let heats = run(&mut s, t0, every, 7);
        assert!(heats.iter().all(|h| *h < DEFAULT_FIGHT_THRESHOLD), "heats={:?}", heats);
    }

    #[test]
    fn heat_cools_down_at_a_low_rate() {
        let t0 = Instant::now();
        let mut s = FightState { heat: 60.0, last: t0 };
        // 2 per minute, starting half a minute after the hot period
        let heats = run(&mut s, t0 + Duration::from_secs(30), Duration::from_secs(30), 10);
        let first_cool = heats.iter().position(|h| *h < DEFAULT_FIGHT_THRESHOLD);
        assert!(matches!(first_cool, Some(i) if i < 10), "heats={:?}", heats);
        // and it stays cool at that rate
        let i = first_cool.unwrap_or_default();
        assert!(heats[i..].iter().all(|h| *h < DEFAULT_FIGHT_THRESHOLD), "heats={:?}", heats);
    }

    #[test]
    fn immediate_burst_after_high_heat_stays_hot() {
        let t0 = Instant::now();
        let mut s = FightState { heat: 60.0, last: t0 };
        for _ in 0..3 {
            assert!(s.mark_updated(t0) >= 60.0);
        }
    }

    #[test]
    fn out_of_order_timestamps_do_not_rewind() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(10);
        let mut s = FightState::new(t1);
        s.mark_updated(t1);
        s.mark_updated(t0);
        assert_eq!(s.last, t1);
        assert_eq!(s.heat, 2.0);
    }
}
