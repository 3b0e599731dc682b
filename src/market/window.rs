use crate::market::types::{DAY_MS, ROUND_LENGTH_MS};
use serde::{Deserialize, Serialize};

/// Bounds of one fixed-length round, `start <= t < end`, in epoch milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct RoundWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl RoundWindow {
    pub fn contains(&self, instant_ms: i64) -> bool {
        self.start_ms <= instant_ms && instant_ms < self.end_ms
    }

    pub fn length_ms(&self) -> i64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        self.end_ms.saturating_sub(now_ms).max(0)
    }
}

/// Maps instants to round windows aligned from the start of their UTC day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCalculator {
    round_length_ms: i64,
}

impl Default for WindowCalculator {
    fn default() -> Self {
        Self {
            round_length_ms: ROUND_LENGTH_MS,
        }
    }
}

impl WindowCalculator {
    /// `round_length_ms` must be positive and divide a day; `SessionArgs::normalize`
    /// enforces this for configured lengths. Anything else falls back to the default.
    pub fn new(round_length_ms: i64) -> Self {
        if round_length_ms <= 0 || DAY_MS % round_length_ms != 0 {
            return Self::default();
        }
        Self { round_length_ms }
    }

    pub fn round_length_ms(&self) -> i64 {
        self.round_length_ms
    }

    pub fn window_for(&self, instant_ms: i64) -> RoundWindow {
        let day_start = instant_ms.saturating_sub(instant_ms.rem_euclid(DAY_MS));
        let offset = instant_ms.saturating_sub(day_start);
        let start_ms =
            day_start.saturating_add(offset - offset.rem_euclid(self.round_length_ms));
        RoundWindow {
            start_ms,
            end_ms: start_ms.saturating_add(self.round_length_ms),
        }
    }

    pub fn is_aligned(&self, window: &RoundWindow) -> bool {
        window.length_ms() == self.round_length_ms && self.window_for(window.start_ms) == *window
    }
}

/// Window of the default 4h round containing `instant_ms`.
pub fn window_for(instant_ms: i64) -> RoundWindow {
    WindowCalculator::default().window_for(instant_ms)
}
