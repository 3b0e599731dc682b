use crate::market::types::ClockConfig;
use crate::market::window::{RoundWindow, WindowCalculator};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

/// Source of local wall-clock readings.
pub trait WallClock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now_ms(&self) -> i64 {
        now_unix_ms()
    }
}

/// Wall clock that only moves when told to. Used for simulation and tests.
#[derive(Debug, Default)]
pub struct ManualWallClock {
    now_ms: AtomicI64,
}

impl ManualWallClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::Relaxed);
    }
}

impl WallClock for ManualWallClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::Relaxed)
    }
}

/// Authoritative view of the current round, as persisted between runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub reference_remote_time_ms: i64,
    pub last_synced_local_ms: i64,
    pub time_left_ms: i64,
}

impl TimerState {
    pub fn window(&self) -> RoundWindow {
        RoundWindow {
            start_ms: self.start_time_ms,
            end_ms: self.end_time_ms,
        }
    }
}

/// Possibly partial answer of the time/round source, in epoch milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteRoundSnapshot {
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    pub now_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockAnomaly {
    RemoteTimeDistrusted {
        offset_ms: i64,
    },
    WindowMismatch {
        supplied: RoundWindow,
        expected: RoundWindow,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub anomalies: Vec<ClockAnomaly>,
    pub round_changed: bool,
    pub time_left_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RehydrateOutcome {
    Fresh,
    Resumed,
    Discarded,
}

#[derive(Debug, Clone)]
pub struct ClockSynchronizer {
    config: ClockConfig,
    calculator: WindowCalculator,
    state: TimerState,
}

impl ClockSynchronizer {
    pub fn new(config: ClockConfig, local_now_ms: i64) -> Self {
        let calculator = WindowCalculator::new(config.round_length_ms);
        let state = Self::state_from_window(calculator.window_for(local_now_ms), local_now_ms);
        Self {
            config,
            calculator,
            state,
        }
    }

    /// Rebuilds the synchronizer from a persisted snapshot. Window identity decides
    /// whether the persisted remainder can be trusted.
    pub fn rehydrate(
        config: ClockConfig,
        persisted: Option<TimerState>,
        local_now_ms: i64,
    ) -> (Self, RehydrateOutcome) {
        let mut clock = Self::new(config, local_now_ms);
        let Some(snapshot) = persisted else {
            return (clock, RehydrateOutcome::Fresh);
        };

        if snapshot.end_time_ms <= snapshot.start_time_ms
            || clock.aligned(snapshot.window()) != clock.calculator.window_for(local_now_ms)
        {
            return (clock, RehydrateOutcome::Discarded);
        }

        let elapsed = local_now_ms
            .saturating_sub(snapshot.last_synced_local_ms)
            .max(0);
        let reference = snapshot.reference_remote_time_ms.saturating_add(elapsed);
        clock.state = TimerState {
            start_time_ms: snapshot.start_time_ms,
            end_time_ms: snapshot.end_time_ms,
            reference_remote_time_ms: reference,
            last_synced_local_ms: local_now_ms,
            time_left_ms: snapshot.window().remaining_ms(reference),
        };
        (clock, RehydrateOutcome::Resumed)
    }

    pub fn reconcile(
        &mut self,
        remote: RemoteRoundSnapshot,
        local_now_ms: i64,
    ) -> ReconcileOutcome {
        let previous_round = self.aligned_round();
        let mut anomalies = Vec::new();
        let length = self.config.round_length_ms;

        let mut reference_now = remote.now_ms.unwrap_or(local_now_ms);
        let offset_ms = reference_now.saturating_sub(local_now_ms);
        if offset_ms.unsigned_abs() > self.config.remote_time_distrust_ms.unsigned_abs() {
            tracing::warn!(offset_ms, "remote time drift too large, using local time");
            anomalies.push(ClockAnomaly::RemoteTimeDistrusted { offset_ms });
            reference_now = local_now_ms;
        }

        let supplied = match (remote.start_ms, remote.end_ms) {
            (Some(start_ms), Some(end_ms)) if end_ms > start_ms => RoundWindow { start_ms, end_ms },
            (None, Some(end_ms)) => RoundWindow {
                start_ms: end_ms.saturating_sub(length),
                end_ms,
            },
            (Some(start_ms), None) => RoundWindow {
                start_ms,
                end_ms: start_ms.saturating_add(length),
            },
            _ => self.calculator.window_for(reference_now),
        };

        let expected = self.calculator.window_for(local_now_ms);
        let tolerance = self.config.window_tolerance_ms.unsigned_abs();
        let window = if supplied.end_ms.abs_diff(expected.end_ms) > tolerance
            || supplied.start_ms.abs_diff(expected.start_ms) > tolerance
        {
            tracing::warn!(
                supplied_start_ms = supplied.start_ms,
                supplied_end_ms = supplied.end_ms,
                expected_end_ms = expected.end_ms,
                "remote round window mismatch, using locally computed window"
            );
            anomalies.push(ClockAnomaly::WindowMismatch { supplied, expected });
            expected
        } else {
            supplied
        };

        self.state = TimerState {
            start_time_ms: window.start_ms,
            end_time_ms: window.end_ms,
            reference_remote_time_ms: reference_now,
            last_synced_local_ms: local_now_ms,
            time_left_ms: window.remaining_ms(reference_now),
        };

        ReconcileOutcome {
            anomalies,
            round_changed: self.aligned_round() != previous_round,
            time_left_ms: self.state.time_left_ms,
        }
    }

    /// Used when the remote source could not be reached: keep the last known state
    /// while its round is still current, otherwise fall back to the calculator.
    pub fn fallback(&mut self, local_now_ms: i64) -> ReconcileOutcome {
        let previous_round = self.aligned_round();
        let expected = self.calculator.window_for(local_now_ms);
        if expected == previous_round {
            let time_left_ms = self.tick(local_now_ms);
            return ReconcileOutcome {
                anomalies: Vec::new(),
                round_changed: false,
                time_left_ms,
            };
        }

        self.state = Self::state_from_window(expected, local_now_ms);
        ReconcileOutcome {
            anomalies: Vec::new(),
            round_changed: true,
            time_left_ms: self.state.time_left_ms,
        }
    }

    /// Advances the corrected clock by the local time elapsed since the last sync.
    pub fn tick(&mut self, local_now_ms: i64) -> i64 {
        let elapsed = local_now_ms
            .saturating_sub(self.state.last_synced_local_ms)
            .max(0);
        self.state.reference_remote_time_ms =
            self.state.reference_remote_time_ms.saturating_add(elapsed);
        self.state.last_synced_local_ms = local_now_ms;
        self.state.time_left_ms = self
            .state
            .window()
            .remaining_ms(self.state.reference_remote_time_ms);
        self.state.time_left_ms
    }

    /// True once `local_now_ms` is at or past the end of the tracked round.
    pub fn has_left_round(&self, local_now_ms: i64) -> bool {
        let round = self.aligned_round();
        !round.contains(local_now_ms) && local_now_ms >= round.start_ms
    }

    pub fn time_left_ms(&self) -> i64 {
        self.state.time_left_ms
    }

    pub fn round(&self) -> RoundWindow {
        self.state.window()
    }

    /// Calculator-aligned window of the tracked round; bars are keyed by it.
    pub fn aligned_round(&self) -> RoundWindow {
        self.aligned(self.state.window())
    }

    pub fn corrected_now_ms(&self) -> i64 {
        self.state.reference_remote_time_ms
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn round_length_ms(&self) -> i64 {
        self.calculator.round_length_ms()
    }

    fn aligned(&self, window: RoundWindow) -> RoundWindow {
        self.calculator
            .window_for(window.start_ms.saturating_add(self.config.window_tolerance_ms))
    }

    fn state_from_window(window: RoundWindow, local_now_ms: i64) -> TimerState {
        TimerState {
            start_time_ms: window.start_ms,
            end_time_ms: window.end_ms,
            reference_remote_time_ms: local_now_ms,
            last_synced_local_ms: local_now_ms,
            time_left_ms: window.remaining_ms(local_now_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::ROUND_LENGTH_MS;

    fn clock_at(local_now_ms: i64) -> ClockSynchronizer {
        ClockSynchronizer::new(ClockConfig::default(), local_now_ms)
    }

    #[test]
    fn reconciles_end_and_now_into_time_left() {
        let mut clock = clock_at(10_000_000);
        let outcome = clock.reconcile(
            RemoteRoundSnapshot {
                start_ms: None,
                end_ms: Some(14_400_000),
                now_ms: Some(10_000_000),
            },
            10_000_000,
        );

        assert_eq!(outcome.time_left_ms, 4_400_000);
        assert!(outcome.anomalies.is_empty());
        assert!(!outcome.round_changed);
        assert_eq!(clock.round(), RoundWindow { start_ms: 0, end_ms: 14_400_000 });
    }

    #[test]
    fn ticks_decrease_time_left_by_elapsed_local_time() {
        let mut clock = clock_at(10_000_000);
        clock.reconcile(
            RemoteRoundSnapshot {
                start_ms: Some(0),
                end_ms: Some(14_400_000),
                now_ms: Some(10_000_000),
            },
            10_000_000,
        );

        let start = clock.time_left_ms();
        for step in 1..=25_i64 {
            let left = clock.tick(10_000_000 + step * 1_000);
            assert_eq!(left, start - step * 1_000);
        }
    }

    #[test]
    fn time_left_never_goes_negative() {
        let mut clock = clock_at(ROUND_LENGTH_MS - 2_500);
        clock.tick(ROUND_LENGTH_MS - 1_500);
        clock.tick(ROUND_LENGTH_MS - 500);
        assert_eq!(clock.tick(ROUND_LENGTH_MS + 500), 0);
        assert_eq!(clock.tick(ROUND_LENGTH_MS + 1_500), 0);
    }

    #[test]
    fn tick_ignores_local_clock_moving_backwards() {
        let mut clock = clock_at(1_000_000);
        let before = clock.tick(1_005_000);
        let after = clock.tick(1_002_000);
        assert_eq!(before, after);
    }

    #[test]
    fn distrusts_remote_time_beyond_threshold() {
        let mut clock = clock_at(10_000_000);
        let outcome = clock.reconcile(
            RemoteRoundSnapshot {
                start_ms: Some(0),
                end_ms: Some(14_400_000),
                now_ms: Some(10_000_000 + 60_000),
            },
            10_000_000,
        );

        assert_eq!(outcome.time_left_ms, 4_400_000);
        assert_eq!(
            outcome.anomalies,
            vec![ClockAnomaly::RemoteTimeDistrusted { offset_ms: 60_000 }]
        );
    }

    #[test]
    fn keeps_remote_time_within_threshold() {
        let mut clock = clock_at(10_000_000);
        let outcome = clock.reconcile(
            RemoteRoundSnapshot {
                start_ms: Some(0),
                end_ms: Some(14_400_000),
                now_ms: Some(10_000_000 + 9_000),
            },
            10_000_000,
        );

        assert_eq!(outcome.time_left_ms, 4_391_000);
        assert!(outcome.anomalies.is_empty());
    }

    #[test]
    fn replaces_mismatched_remote_window_with_local_window() {
        let mut clock = clock_at(10_000_000);
        let outcome = clock.reconcile(
            RemoteRoundSnapshot {
                start_ms: Some(ROUND_LENGTH_MS),
                end_ms: Some(2 * ROUND_LENGTH_MS),
                now_ms: None,
            },
            10_000_000,
        );

        assert_eq!(clock.round(), RoundWindow { start_ms: 0, end_ms: ROUND_LENGTH_MS });
        assert_eq!(outcome.time_left_ms, ROUND_LENGTH_MS - 10_000_000);
        assert!(matches!(
            outcome.anomalies.as_slice(),
            [ClockAnomaly::WindowMismatch { .. }]
        ));
    }

    #[test]
    fn accepts_remote_window_within_tolerance() {
        let mut clock = clock_at(10_000_000);
        let outcome = clock.reconcile(
            RemoteRoundSnapshot {
                start_ms: Some(400),
                end_ms: Some(ROUND_LENGTH_MS + 400),
                now_ms: Some(10_000_000),
            },
            10_000_000,
        );

        assert!(outcome.anomalies.is_empty());
        assert_eq!(clock.round().end_ms, ROUND_LENGTH_MS + 400);
        assert_eq!(clock.aligned_round(), RoundWindow { start_ms: 0, end_ms: ROUND_LENGTH_MS });
    }

    #[test]
    fn derives_missing_window_from_calculator() {
        let mut clock = clock_at(10_000_000);
        let outcome = clock.reconcile(RemoteRoundSnapshot::default(), 10_000_000);

        assert_eq!(clock.round(), RoundWindow { start_ms: 0, end_ms: ROUND_LENGTH_MS });
        assert_eq!(outcome.time_left_ms, 4_400_000);
    }

    #[test]
    fn reconcile_after_round_end_reports_rollover() {
        let mut clock = clock_at(ROUND_LENGTH_MS - 1_000);
        assert_eq!(clock.tick(ROUND_LENGTH_MS + 2_000), 0);

        let outcome = clock.reconcile(
            RemoteRoundSnapshot {
                start_ms: Some(0),
                end_ms: Some(ROUND_LENGTH_MS),
                now_ms: Some(ROUND_LENGTH_MS + 2_000),
            },
            ROUND_LENGTH_MS + 2_000,
        );

        assert!(outcome.round_changed);
        assert_eq!(outcome.time_left_ms, ROUND_LENGTH_MS - 2_000);
    }

    #[test]
    fn fallback_keeps_last_state_inside_same_round() {
        let mut clock = clock_at(10_000_000);
        clock.reconcile(
            RemoteRoundSnapshot {
                start_ms: Some(0),
                end_ms: Some(ROUND_LENGTH_MS),
                now_ms: Some(10_005_000),
            },
            10_000_000,
        );

        let outcome = clock.fallback(10_001_000);
        assert!(!outcome.round_changed);
        assert_eq!(outcome.time_left_ms, ROUND_LENGTH_MS - 10_006_000);
    }

    #[test]
    fn fallback_rolls_over_from_calculator() {
        let mut clock = clock_at(10_000_000);
        let outcome = clock.fallback(ROUND_LENGTH_MS + 60_000);

        assert!(outcome.round_changed);
        assert_eq!(clock.round().start_ms, ROUND_LENGTH_MS);
        assert_eq!(outcome.time_left_ms, ROUND_LENGTH_MS - 60_000);
    }

    #[test]
    fn rehydrates_same_round_bridging_downtime() {
        let persisted = TimerState {
            start_time_ms: 0,
            end_time_ms: ROUND_LENGTH_MS,
            reference_remote_time_ms: 10_000_000,
            last_synced_local_ms: 9_999_000,
            time_left_ms: 4_400_000,
        };

        let (clock, outcome) =
            ClockSynchronizer::rehydrate(ClockConfig::default(), Some(persisted), 10_120_000);

        assert_eq!(outcome, RehydrateOutcome::Resumed);
        assert_eq!(clock.corrected_now_ms(), 10_121_000);
        assert_eq!(clock.time_left_ms(), ROUND_LENGTH_MS - 10_121_000);
    }

    #[test]
    fn rehydrating_ended_round_reinitializes_from_calculator() {
        let persisted = TimerState {
            start_time_ms: 0,
            end_time_ms: ROUND_LENGTH_MS,
            reference_remote_time_ms: 10_000_000,
            last_synced_local_ms: 10_000_000,
            time_left_ms: 4_400_000,
        };
        let local_now = ROUND_LENGTH_MS + 30_000;

        let (clock, outcome) =
            ClockSynchronizer::rehydrate(ClockConfig::default(), Some(persisted), local_now);

        assert_eq!(outcome, RehydrateOutcome::Discarded);
        assert_eq!(
            clock.round(),
            RoundWindow {
                start_ms: ROUND_LENGTH_MS,
                end_ms: 2 * ROUND_LENGTH_MS
            }
        );
        assert_eq!(clock.time_left_ms(), ROUND_LENGTH_MS - 30_000);
    }

    #[test]
    fn rehydrate_without_snapshot_starts_fresh() {
        let (clock, outcome) = ClockSynchronizer::rehydrate(ClockConfig::default(), None, 42_000);
        assert_eq!(outcome, RehydrateOutcome::Fresh);
        assert_eq!(clock.time_left_ms(), ROUND_LENGTH_MS - 42_000);
    }

    #[test]
    fn manual_wall_clock_advances() {
        let wall = ManualWallClock::new(1_000);
        wall.advance(500);
        assert_eq!(wall.now_ms(), 1_500);
        wall.set(9);
        assert_eq!(wall.now_ms(), 9);
    }

    #[test]
    fn extreme_remote_values_keep_local_window() {
        let mut clock = clock_at(10_000_000);

        let outcome = clock.reconcile(
            RemoteRoundSnapshot {
                start_ms: Some(0),
                end_ms: Some(ROUND_LENGTH_MS),
                now_ms: Some(i64::MIN),
            },
            10_000_000,
        );
        assert!(matches!(
            outcome.anomalies.as_slice(),
            [ClockAnomaly::RemoteTimeDistrusted { .. }]
        ));
        assert_eq!(outcome.time_left_ms, ROUND_LENGTH_MS - 10_000_000);

        let outcome = clock.reconcile(
            RemoteRoundSnapshot {
                start_ms: None,
                end_ms: Some(i64::MAX),
                now_ms: None,
            },
            10_000_000,
        );
        assert!(matches!(
            outcome.anomalies.as_slice(),
            [ClockAnomaly::WindowMismatch { .. }]
        ));
        assert_eq!(clock.round(), RoundWindow { start_ms: 0, end_ms: ROUND_LENGTH_MS });
        assert_eq!(outcome.time_left_ms, ROUND_LENGTH_MS - 10_000_000);
    }

    #[test]
    fn detects_local_time_past_the_tracked_round() {
        let clock = clock_at(10_000_000);
        assert!(!clock.has_left_round(ROUND_LENGTH_MS - 1));
        assert!(clock.has_left_round(ROUND_LENGTH_MS));
        assert!(!clock.has_left_round(-1));
    }
}
