// Risk management module
pub mod circuit_breakers;

pub use circuit_breakers::{EntryBreaker, EntryTrip};

use crate::error::BotError;
use serde::{Deserialize, Serialize};

/// Trailing stop that arms after a favorable move and then follows price
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TrailingStopConfig {
    pub activation_pct: f64, // Favorable move from entry that arms the stop
    pub callback_pct: f64,   // Distance kept behind the best price
}

/// One rung of the take-profit ladder
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TakeProfitStep {
    pub pct: f64,      // Favorable move from entry
    pub fraction: f64, // Share of the remaining size to close, (0, 1]
}

/// Exit rules applied to every main position. Percentages are in percent
/// (2.0 means 2%).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskParams {
    pub stop_loss_pct: Option<f64>,
    pub take_profit: Vec<TakeProfitStep>,
    pub trailing_stop: Option<TrailingStopConfig>,
    pub entry_block_cooldown_secs: u64,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            stop_loss_pct: Some(8.0), // -8% from (average) entry
            take_profit: vec![
                TakeProfitStep { pct: 5.0, fraction: 0.5 },
                TakeProfitStep { pct: 10.0, fraction: 1.0 },
            ],
            trailing_stop: Some(TrailingStopConfig {
                activation_pct: 12.0,
                callback_pct: 5.0,
            }),
            entry_block_cooldown_secs: 900,
        }
    }
}

impl RiskParams {
    pub fn validate(&self) -> Result<(), BotError> {
        if let Some(sl) = self.stop_loss_pct {
            if !(sl > 0.0 && sl < 100.0) {
                return Err(BotError::Config(format!("stop_loss_pct out of range: {}", sl)));
            }
        }
        for step in &self.take_profit {
            if step.pct <= 0.0 {
                return Err(BotError::Config(format!("take_profit pct must be > 0: {}", step.pct)));
            }
            if !(step.fraction > 0.0 && step.fraction <= 1.0) {
                return Err(BotError::Config(format!(
                    "take_profit fraction must be in (0, 1]: {}",
                    step.fraction
                )));
            }
        }
        if let Some(ts) = self.trailing_stop {
            if ts.activation_pct < 0.0 || !(ts.callback_pct > 0.0 && ts.callback_pct < 100.0) {
                return Err(BotError::Config(format!("invalid trailing stop: {:?}", ts)));
            }
        }
        Ok(())
    }

    pub fn entry_block_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.entry_block_cooldown_secs as i64)
    }
}
