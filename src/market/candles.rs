use crate::market::types::Bar;
use crate::market::window::{RoundWindow, WindowCalculator};
use std::iter::Chain;

pub type BarSnapshot<'a> = Chain<std::slice::Iter<'a, Bar>, std::option::Iter<'a, Bar>>;

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Applied {
        historical: usize,
        has_current: bool,
        discarded: usize,
    },
    Malformed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CurrentUpdateOutcome {
    Applied,
    Malformed {
        reason: String,
    },
    StaleAsset,
    StaleRound {
        round_start_ms: i64,
        found_start_ms: i64,
    },
    OutOfSequence {
        expected_start_ms: Option<i64>,
        found_start_ms: i64,
    },
}

/// Closed bars plus at most one in-progress bar for a single asset.
///
/// `historical` followed by `current` is always ordered and gap-free: batches are
/// validated before they replace anything, and incremental updates only ever
/// replace the in-progress bar.
#[derive(Debug, Clone)]
pub struct CandleReconciler {
    calculator: WindowCalculator,
    round_length_ms: i64,
    asset: Option<String>,
    historical: Vec<Bar>,
    current: Option<Bar>,
}

impl CandleReconciler {
    pub fn new(round_length_ms: i64) -> Self {
        let calculator = WindowCalculator::new(round_length_ms);
        Self {
            round_length_ms: calculator.round_length_ms(),
            calculator,
            asset: None,
            historical: Vec::new(),
            current: None,
        }
    }

    pub fn asset(&self) -> Option<&str> {
        self.asset.as_deref()
    }

    pub fn historical(&self) -> &[Bar] {
        &self.historical
    }

    pub fn current(&self) -> Option<&Bar> {
        self.current.as_ref()
    }

    pub fn reset(&mut self) {
        self.asset = None;
        self.historical.clear();
        self.current = None;
    }

    /// Partitions a time-ordered batch around `now_ms`. The first bar still open
    /// becomes current; anything after it is not applicable yet and is dropped.
    pub fn replace_all(&mut self, bars: Vec<Bar>, for_asset: &str, now_ms: i64) -> BatchOutcome {
        if self.asset.as_deref() != Some(for_asset) {
            self.reset();
            self.asset = Some(for_asset.to_string());
        }

        if let Err(reason) = self.validate_batch(&bars) {
            return BatchOutcome::Malformed { reason };
        }

        let split = bars
            .iter()
            .position(|bar| bar.end_ms(self.round_length_ms) > now_ms)
            .unwrap_or(bars.len());
        let discarded = bars.len().saturating_sub(split + 1);

        let mut bars = bars;
        bars.truncate(split + 1);
        let current = if split < bars.len() { bars.pop() } else { None };

        self.historical = bars;
        self.current = current;

        BatchOutcome::Applied {
            historical: self.historical.len(),
            has_current: self.current.is_some(),
            discarded,
        }
    }

    /// Replaces the in-progress bar without touching history. Bars for another
    /// asset or another round are ignored.
    pub fn apply_current_update(
        &mut self,
        bar: Bar,
        for_asset: &str,
        round: RoundWindow,
    ) -> CurrentUpdateOutcome {
        if let Err(error) = bar.validate() {
            return CurrentUpdateOutcome::Malformed {
                reason: error.to_string(),
            };
        }
        if self.asset.as_deref() != Some(for_asset) {
            return CurrentUpdateOutcome::StaleAsset;
        }
        if bar.start_ms != round.start_ms {
            return CurrentUpdateOutcome::StaleRound {
                round_start_ms: round.start_ms,
                found_start_ms: bar.start_ms,
            };
        }

        let expected_start_ms = match (&self.current, self.historical.last()) {
            (Some(current), _) => Some(current.start_ms),
            (None, Some(last)) => Some(last.end_ms(self.round_length_ms)),
            (None, None) => None,
        };
        if expected_start_ms.is_some_and(|expected| expected != bar.start_ms) {
            return CurrentUpdateOutcome::OutOfSequence {
                expected_start_ms,
                found_start_ms: bar.start_ms,
            };
        }

        self.current = Some(bar);
        CurrentUpdateOutcome::Applied
    }

    /// Ordered view of history followed by the in-progress bar. Cheap to clone and
    /// restart.
    pub fn snapshot(&self) -> BarSnapshot<'_> {
        self.historical.iter().chain(self.current.iter())
    }

    pub fn snapshot_vec(&self) -> Vec<Bar> {
        self.snapshot().copied().collect()
    }

    fn validate_batch(&self, bars: &[Bar]) -> Result<(), String> {
        for bar in bars {
            bar.validate().map_err(|error| error.to_string())?;
            let span = RoundWindow {
                start_ms: bar.start_ms,
                end_ms: bar.end_ms(self.round_length_ms),
            };
            if !self.calculator.is_aligned(&span) {
                return Err(format!("bar at {} is not aligned to a round", bar.start_ms));
            }
        }
        for pair in bars.windows(2) {
            let expected = pair[0].end_ms(self.round_length_ms);
            if pair[1].start_ms != expected {
                return Err(format!(
                    "bar at {} does not follow bar at {} (expected {expected})",
                    pair[1].start_ms, pair[0].start_ms
                ));
            }
        }
        Ok(())
    }
}
