//! Multi-entry accumulation rules (DCA and pyramiding) and the per-position
//! entry ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BotError;
use crate::models::PositionSide;
use crate::strategy::SignalUpdate;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerBasis {
    /// `trigger_value` percent of the weighted entry price
    PercentOfEntry,
    /// `trigger_value` times the current ATR
    AtrMultiple,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccumulationMode {
    /// Add when price moves against the position
    Dca,
    /// Add when price moves with the position and the trend agrees
    Pyramiding,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AccumulationConfig {
    pub enabled: bool,
    pub mode: AccumulationMode,
    pub entry_limit: u32, // Total entries including the initial one
    pub entry_size_multiplier: f64,
    pub trigger_basis: TriggerBasis,
    pub trigger_value: f64,
    pub require_rsi_confirm: bool,
    pub block_against_trend: bool,
    pub base_unit: f64,              // Size of the initial entry, in contracts
    pub size_table: Option<Vec<f64>>, // Per-step sizes, overrides the multiplier
}

impl Default for AccumulationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: AccumulationMode::Dca,
            entry_limit: 3,
            entry_size_multiplier: 1.5,
            trigger_basis: TriggerBasis::PercentOfEntry,
            trigger_value: 2.0,
            require_rsi_confirm: false,
            block_against_trend: true,
            base_unit: 1.0,
            size_table: None,
        }
    }
}

impl AccumulationConfig {
    pub fn validate(&self) -> Result<(), BotError> {
        if self.entry_limit < 1 {
            return Err(BotError::Config("entry_limit must be at least 1".into()));
        }
        if !(self.entry_size_multiplier > 0.0) {
            return Err(BotError::Config(format!(
                "entry_size_multiplier must be > 0, got {}",
                self.entry_size_multiplier
            )));
        }
        if !(self.trigger_value > 0.0) {
            return Err(BotError::Config(format!(
                "trigger_value must be > 0, got {}",
                self.trigger_value
            )));
        }
        if !(self.base_unit > 0.0) {
            return Err(BotError::Config("base_unit must be > 0".into()));
        }
        if let Some(ref table) = self.size_table {
            if table.iter().any(|size| !(*size > 0.0)) {
                return Err(BotError::Config("size_table entries must be > 0".into()));
            }
        }
        Ok(())
    }

    /// Size of the entry at `index` (0 is the initial entry)
    pub fn entry_size(&self, index: usize) -> f64 {
        if let Some(size) = self.size_table.as_ref().and_then(|table| table.get(index)) {
            return *size;
        }
        self.base_unit * self.entry_size_multiplier.powi(index as i32)
    }

    /// Price at which the next entry triggers, None when ATR is required but unknown
    pub fn trigger_level(
        &self,
        side: PositionSide,
        reference_price: f64,
        atr: Option<f64>,
    ) -> Option<f64> {
        let distance = match self.trigger_basis {
            TriggerBasis::PercentOfEntry => reference_price * self.trigger_value / 100.0,
            TriggerBasis::AtrMultiple => atr.filter(|a| *a > 0.0)? * self.trigger_value,
        };
        let direction = match self.mode {
            AccumulationMode::Dca => -side.sign(),
            AccumulationMode::Pyramiding => side.sign(),
        };
        Some(reference_price + direction * distance)
    }

    fn crossed(&self, side: PositionSide, level: f64, price: f64) -> bool {
        match (self.mode, side) {
            (AccumulationMode::Dca, PositionSide::Long)
            | (AccumulationMode::Pyramiding, PositionSide::Short) => price <= level,
            (AccumulationMode::Dca, PositionSide::Short)
            | (AccumulationMode::Pyramiding, PositionSide::Long) => price >= level,
        }
    }

    pub fn entry_reason(&self) -> EntryReason {
        match self.mode {
            AccumulationMode::Dca => EntryReason::DcaEntry,
            AccumulationMode::Pyramiding => EntryReason::PyramidingEntry,
        }
    }

    /// Decide whether the position takes another entry at `price`.
    ///
    /// Counter-trend conditions only suppress entries; they never close anything.
    pub fn evaluate(
        &self,
        ledger: &AccumulationLedger,
        side: PositionSide,
        price: f64,
        signal: &SignalUpdate,
    ) -> Option<PlannedEntry> {
        if !self.enabled || ledger.is_empty() {
            return None;
        }
        let index = ledger.entry_count();
        if index >= self.entry_limit as usize {
            tracing::debug!("Entry limit {} reached", self.entry_limit);
            return None;
        }

        let reference = ledger.weighted_average()?;
        let trigger = self.trigger_level(side, reference, signal.atr)?;
        if !self.crossed(side, trigger, price) {
            return None;
        }

        if self.require_rsi_confirm && !signal.rsi_confirms(side) {
            tracing::debug!(
                symbol = %signal.symbol,
                "🔍 Trigger ${:.4} crossed but RSI does not confirm",
                trigger
            );
            return None;
        }
        if self.block_against_trend && signal.trend.strongly_opposes(side) {
            tracing::info!(
                symbol = %signal.symbol,
                trend = ?signal.trend,
                "Entry blocked: trend strongly opposes {} position",
                side
            );
            return None;
        }
        if self.mode == AccumulationMode::Pyramiding && !signal.trend.supports(side) {
            return None;
        }

        Some(PlannedEntry {
            index,
            quantity: self.entry_size(index),
            reason: self.entry_reason(),
            trigger,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryReason {
    InitialEntry,
    DcaEntry,
    PyramidingEntry,
}

/// Next entry chosen by [`AccumulationConfig::evaluate`]
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedEntry {
    pub index: usize,
    pub quantity: f64,
    pub reason: EntryReason,
    pub trigger: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub price: f64,
    pub quantity: f64,
    pub investment: f64,
    pub timestamp: DateTime<Utc>,
    pub reason: EntryReason,
    pub index: usize,
}

/// Append-only record of the entries of one position.
///
/// Advisory only: position size always comes from the exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccumulationLedger {
    entries: Vec<LedgerEntry>,
}

impl AccumulationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        price: f64,
        quantity: f64,
        reason: EntryReason,
        timestamp: DateTime<Utc>,
    ) -> &LedgerEntry {
        let index = self.entries.len();
        self.entries.push(LedgerEntry {
            price,
            quantity,
            investment: price * quantity,
            timestamp,
            reason,
            index,
        });
        &self.entries[index]
    }

    /// Σ(price × qty) / Σ(qty)
    pub fn weighted_average(&self) -> Option<f64> {
        let quantity = self.total_quantity();
        if quantity <= 0.0 {
            return None;
        }
        Some(self.entries.iter().map(|e| e.investment).sum::<f64>() / quantity)
    }

    pub fn total_quantity(&self) -> f64 {
        self.entries.iter().map(|e| e.quantity).sum()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Entries added against the position (DCA)
    pub fn adverse_entries(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.reason == EntryReason::DcaEntry)
            .count()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrendState;

    fn ledger_with(entries: &[(f64, f64)]) -> AccumulationLedger {
        let mut ledger = AccumulationLedger::new();
        for (i, (price, qty)) in entries.iter().enumerate() {
            let reason = if i == 0 {
                EntryReason::InitialEntry
            } else {
                EntryReason::DcaEntry
            };
            ledger.record(*price, *qty, reason, Utc::now());
        }
        ledger
    }

    fn signal() -> SignalUpdate {
        SignalUpdate::neutral("BTC-USDT-SWAP")
    }

    #[test]
    fn test_weighted_average() {
        let ledger = ledger_with(&[(100.0, 1.0), (90.0, 1.0)]);
        assert_eq!(ledger.weighted_average(), Some(95.0));
        assert_eq!(ledger.adverse_entries(), 1);
        assert!(AccumulationLedger::new().weighted_average().is_none());
    }

    #[test]
    fn test_entry_limit_stops_new_entries() {
        let config = AccumulationConfig {
            entry_limit: 3,
            ..AccumulationConfig::default()
        };
        let ledger = ledger_with(&[(100.0, 1.0), (98.0, 1.5), (96.0, 2.25)]);

        assert!(config.evaluate(&ledger, PositionSide::Long, 50.0, &signal()).is_none());
    }

    #[test]
    fn test_dca_trigger_percent_of_entry() {
        let config = AccumulationConfig::default(); // 2% DCA, multiplier 1.5
        let ledger = ledger_with(&[(100.0, 1.0)]);

        assert!(config.evaluate(&ledger, PositionSide::Long, 98.5, &signal()).is_none());

        let entry = config
            .evaluate(&ledger, PositionSide::Long, 97.9, &signal())
            .unwrap();
        assert_eq!(entry.index, 1);
        assert_eq!(entry.quantity, 1.5);
        assert_eq!(entry.reason, EntryReason::DcaEntry);

        // Short DCA triggers above entry
        assert!(config.evaluate(&ledger, PositionSide::Short, 102.1, &signal()).is_some());
    }

    #[test]
    fn test_atr_trigger_needs_atr() {
        let config = AccumulationConfig {
            trigger_basis: TriggerBasis::AtrMultiple,
            trigger_value: 2.0,
            ..AccumulationConfig::default()
        };
        let ledger = ledger_with(&[(100.0, 1.0)]);

        assert!(config.evaluate(&ledger, PositionSide::Long, 80.0, &signal()).is_none());

        let mut with_atr = signal();
        with_atr.atr = Some(3.0);
        assert!(config.evaluate(&ledger, PositionSide::Long, 94.5, &with_atr).is_none());
        assert!(config.evaluate(&ledger, PositionSide::Long, 94.0, &with_atr).is_some());
    }

    #[test]
    fn test_rsi_and_trend_gates() {
        let config = AccumulationConfig {
            require_rsi_confirm: true,
            ..AccumulationConfig::default()
        };
        let ledger = ledger_with(&[(100.0, 1.0)]);

        let mut update = signal();
        assert!(config.evaluate(&ledger, PositionSide::Long, 90.0, &update).is_none());

        update.rsi_confirms_long = true;
        assert!(config.evaluate(&ledger, PositionSide::Long, 90.0, &update).is_some());

        update.trend = TrendState::StrongDown;
        assert!(config.evaluate(&ledger, PositionSide::Long, 90.0, &update).is_none());
    }

    #[test]
    fn test_pyramiding_needs_favorable_move_and_trend() {
        let config = AccumulationConfig {
            mode: AccumulationMode::Pyramiding,
            ..AccumulationConfig::default()
        };
        let ledger = ledger_with(&[(100.0, 1.0)]);
        let mut update = signal();

        assert!(config.evaluate(&ledger, PositionSide::Long, 103.0, &update).is_none());

        update.trend = TrendState::Up;
        let entry = config
            .evaluate(&ledger, PositionSide::Long, 103.0, &update)
            .unwrap();
        assert_eq!(entry.reason, EntryReason::PyramidingEntry);
        assert!(config.evaluate(&ledger, PositionSide::Long, 97.0, &update).is_none());
    }

    #[test]
    fn test_size_table_overrides_multiplier() {
        let config = AccumulationConfig {
            size_table: Some(vec![1.0, 3.0]),
            ..AccumulationConfig::default()
        };
        assert_eq!(config.entry_size(1), 3.0);
        // Past the table the geometric rule applies
        assert_eq!(config.entry_size(2), 1.0 * 1.5 * 1.5);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_limit = AccumulationConfig {
            entry_limit: 0,
            ..AccumulationConfig::default()
        };
        assert!(zero_limit.validate().is_err());

        let bad_multiplier = AccumulationConfig {
            entry_size_multiplier: 0.0,
            ..AccumulationConfig::default()
        };
        assert!(bad_multiplier.validate().is_err());
        assert!(AccumulationConfig::default().validate().is_ok());
    }
}
