use crate::error::AppError;
use crate::market::types::{StakeIntent, StakeSide};
use crate::market::window::RoundWindow;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum GateState {
    Open,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateTransition {
    Locked,
    Reopened,
}

/// Stake accepted for the round that was open when it was authorized.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizedStake {
    pub asset: String,
    pub side: StakeSide,
    pub amount: f64,
    pub round_start_ms: i64,
    pub round_end_ms: i64,
}

/// OPEN while the tracked round has time left. Once LOCKED, only a different
/// round with time left reopens it.
#[derive(Debug, Clone)]
pub struct RoundGate {
    state: GateState,
    locked_round: Option<RoundWindow>,
}

impl RoundGate {
    pub fn new(time_left_ms: i64, round: RoundWindow) -> Self {
        if time_left_ms > 0 {
            Self {
                state: GateState::Open,
                locked_round: None,
            }
        } else {
            Self {
                state: GateState::Locked,
                locked_round: Some(round),
            }
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == GateState::Open
    }

    pub fn observe(&mut self, time_left_ms: i64, round: RoundWindow) -> Option<GateTransition> {
        match self.state {
            GateState::Open if time_left_ms <= 0 => {
                self.state = GateState::Locked;
                self.locked_round = Some(round);
                Some(GateTransition::Locked)
            }
            GateState::Locked if time_left_ms > 0 && self.locked_round != Some(round) => {
                self.state = GateState::Open;
                self.locked_round = None;
                Some(GateTransition::Reopened)
            }
            _ => None,
        }
    }

    pub fn ensure_open(&self, round: RoundWindow) -> Result<(), AppError> {
        match self.state {
            GateState::Open => Ok(()),
            GateState::Locked => Err(AppError::RoundLocked {
                round_end_ms: round.end_ms,
            }),
        }
    }

    pub fn authorize(
        &self,
        intent: StakeIntent,
        tracked_asset: &str,
        round: RoundWindow,
    ) -> Result<AuthorizedStake, AppError> {
        let intent = intent.normalize()?;
        self.ensure_open(round)?;
        if intent.asset != tracked_asset {
            return Err(AppError::InvalidArgument(format!(
                "stake asset '{}' does not match tracked asset '{tracked_asset}'",
                intent.asset
            )));
        }

        Ok(AuthorizedStake {
            asset: intent.asset,
            side: intent.side,
            amount: intent.amount,
            round_start_ms: round.start_ms,
            round_end_ms: round.end_ms,
        })
    }
}
