use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::models::{PositionSide, PositionSnapshot};
use crate::risk::{RiskParams, TrailingStopConfig};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TakeProfit { level: usize },
    /// Hedge reached its target and takes the main position with it
    HedgeLinked,
    HedgeTakeProfit,
    HedgeTrendExit,
}

/// A decided exit: which rule fired and how much of the size to close
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitSignal {
    pub reason: ExitReason,
    pub fraction: f64,
}

impl ExitSignal {
    pub fn full(reason: ExitReason) -> Self {
        Self {
            reason,
            fraction: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TakeProfitLevel {
    pub price: f64,
    pub fraction: f64,
    pub hit: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub user: String,
    pub exchange: String,
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,        // Exchange-reported, always authoritative
    pub entry_price: f64, // Exchange volume-weighted entry
    pub leverage: f64,
    pub stop_loss: Option<f64>,
    pub take_profits: Vec<TakeProfitLevel>,
    pub trailing: Option<TrailingStopConfig>,
    pub trailing_stop: Option<f64>, // Armed trailing level, only ratchets favorably
    pub best_price: f64,            // High water mark (long) / low water mark (short)
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub mark_price: Option<f64>,
    pub exit_pending: bool, // A closing order is in flight
    pub manual_levels: bool,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Create from the first exchange snapshot showing a non-zero size
    pub fn open(user: &str, exchange: &str, snapshot: &PositionSnapshot, risk: &RiskParams) -> Self {
        let mut position = Self {
            user: user.to_string(),
            exchange: exchange.to_string(),
            symbol: snapshot.symbol.clone(),
            side: snapshot.side,
            size: snapshot.size,
            entry_price: snapshot.entry_price,
            leverage: snapshot.leverage,
            stop_loss: None,
            take_profits: Vec::new(),
            trailing: risk.trailing_stop,
            trailing_stop: None,
            best_price: snapshot.entry_price,
            unrealized_pnl: snapshot.unrealized_pnl,
            realized_pnl: snapshot.realized_pnl,
            mark_price: snapshot.mark_price,
            exit_pending: false,
            manual_levels: false,
            opened_at: snapshot.updated_at,
            updated_at: snapshot.updated_at,
        };
        position.derive_levels(risk);

        tracing::info!(
            "📈 Opened {} {} size={} @ ${:.4} (SL: {:?})",
            position.side,
            position.symbol,
            position.size,
            position.entry_price,
            position.stop_loss
        );
        position
    }

    /// Bare position with no exit rules, as used for hedges
    pub fn without_levels(user: &str, exchange: &str, snapshot: &PositionSnapshot) -> Self {
        let mut position = Self::open(user, exchange, snapshot, &RiskParams {
            stop_loss_pct: None,
            take_profit: Vec::new(),
            trailing_stop: None,
            ..RiskParams::default()
        });
        position.manual_levels = true;
        position
    }

    /// Fix the stop-loss and ladder instead of deriving them from entry
    pub fn with_levels(mut self, stop_loss: Option<f64>, take_profits: Vec<(f64, f64)>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profits = take_profits
            .into_iter()
            .map(|(price, fraction)| TakeProfitLevel {
                price,
                fraction,
                hit: false,
            })
            .collect();
        self.manual_levels = true;
        self
    }

    /// Overwrite size, entry and PnL with the exchange's view.
    ///
    /// Levels are re-derived when the entry moved (a new fill re-weighted it).
    pub fn update_from_exchange(&mut self, snapshot: &PositionSnapshot, risk: &RiskParams) {
        let entry_moved = (snapshot.entry_price - self.entry_price).abs() > f64::EPSILON;
        let size_changed = (snapshot.size - self.size).abs() > f64::EPSILON;

        self.size = snapshot.size.max(0.0);
        self.entry_price = snapshot.entry_price;
        self.leverage = snapshot.leverage;
        self.unrealized_pnl = snapshot.unrealized_pnl;
        self.realized_pnl = snapshot.realized_pnl;
        if snapshot.mark_price.is_some() {
            self.mark_price = snapshot.mark_price;
        }
        if snapshot.updated_at > self.updated_at {
            self.updated_at = snapshot.updated_at;
        }

        if size_changed {
            self.exit_pending = false;
        }
        if entry_moved && !self.manual_levels && self.entry_price > 0.0 {
            tracing::debug!(
                symbol = %self.symbol,
                "Entry re-weighted to ${:.4}, re-deriving exit levels",
                self.entry_price
            );
            self.derive_levels(risk);
        }
    }

    fn derive_levels(&mut self, risk: &RiskParams) {
        if self.manual_levels || self.entry_price <= 0.0 {
            return;
        }
        let sign = self.side.sign();
        self.stop_loss = risk
            .stop_loss_pct
            .map(|pct| self.entry_price * (1.0 - sign * pct / 100.0));
        self.take_profits = risk
            .take_profit
            .iter()
            .map(|step| TakeProfitLevel {
                price: self.entry_price * (1.0 + sign * step.pct / 100.0),
                fraction: step.fraction,
                hit: false,
            })
            .collect();
    }

    pub fn is_closed(&self) -> bool {
        self.size <= 0.0
    }

    /// Long: (current - entry) x size. Short: (entry - current) x size.
    pub fn calculate_pnl(&self, current_price: f64) -> f64 {
        self.side.sign() * (current_price - self.entry_price) * self.size
    }

    /// Move of `price` from entry in the position's favor, in percent
    pub fn favorable_move_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.side.sign() * (price - self.entry_price) / self.entry_price * 100.0
    }

    /// Track the best price and ratchet the trailing stop
    pub fn update_trailing_stop(&mut self, current_price: f64) {
        let trailing = match self.trailing {
            Some(trailing) => trailing,
            None => return,
        };

        let improved = match self.side {
            PositionSide::Long => current_price > self.best_price,
            PositionSide::Short => current_price < self.best_price,
        };
        if improved {
            self.best_price = current_price;
        }

        if self.favorable_move_pct(self.best_price) < trailing.activation_pct {
            return;
        }

        let candidate = self.best_price * (1.0 - self.side.sign() * trailing.callback_pct / 100.0);
        self.trailing_stop = Some(match (self.side, self.trailing_stop) {
            (PositionSide::Long, Some(current)) => current.max(candidate),
            (PositionSide::Short, Some(current)) => current.min(candidate),
            (_, None) => candidate,
        });
    }

    fn adverse_breach(&self, level: f64, price: f64) -> bool {
        match self.side {
            PositionSide::Long => price <= level,
            PositionSide::Short => price >= level,
        }
    }

    fn favorable_reach(&self, level: f64, price: f64) -> bool {
        match self.side {
            PositionSide::Long => price >= level,
            PositionSide::Short => price <= level,
        }
    }

    /// Exit to take at `current_price`, most protective rule first:
    /// stop-loss, then trailing stop, then the first unfired ladder level.
    pub fn exit_signal(&self, current_price: f64) -> Option<ExitSignal> {
        if self.is_closed() {
            return None;
        }

        if let Some(sl) = self.stop_loss {
            if self.adverse_breach(sl, current_price) {
                return Some(ExitSignal::full(ExitReason::StopLoss));
            }
        }

        if let Some(ts) = self.trailing_stop {
            if self.adverse_breach(ts, current_price) {
                return Some(ExitSignal::full(ExitReason::TrailingStop));
            }
        }

        let last = self.take_profits.len().saturating_sub(1);
        self.take_profits
            .iter()
            .enumerate()
            .find(|(_, tp)| !tp.hit && self.favorable_reach(tp.price, current_price))
            .map(|(level, tp)| ExitSignal {
                reason: ExitReason::TakeProfit { level },
                // The last rung always flattens what is left
                fraction: if level == last { 1.0 } else { tp.fraction },
            })
    }

    pub fn should_close(&self, current_price: f64) -> bool {
        self.exit_signal(current_price).is_some()
    }

    /// A ladder level fires once
    pub fn mark_take_profit(&mut self, level: usize, hit: bool) {
        if let Some(tp) = self.take_profits.get_mut(level) {
            tp.hit = hit;
        }
    }
}

/// Read side of the position caches.
///
/// The owning engine replaces whole records; readers get `Arc` snapshots and
/// never see a half-applied update.
#[derive(Default)]
pub struct PositionBook {
    positions: RwLock<HashMap<(String, PositionSide), Arc<Position>>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, position: &Position) {
        let mut positions = self.positions.write().unwrap_or_else(|e| e.into_inner());
        if position.is_closed() {
            positions.remove(&(position.symbol.clone(), position.side));
        } else {
            positions.insert(
                (position.symbol.clone(), position.side),
                Arc::new(position.clone()),
            );
        }
    }

    pub fn remove(&self, symbol: &str, side: PositionSide) {
        self.positions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(symbol.to_string(), side));
    }

    pub fn get(&self, symbol: &str, side: PositionSide) -> Option<Arc<Position>> {
        self.positions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(symbol.to_string(), side))
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<Position>> {
        self.positions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}
