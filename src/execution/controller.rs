//! Per-symbol decision logic: one main position, an optional hedge, the
//! accumulation ledger and the entry breaker.
//!
//! Pure state machine. Every method returns the orders it wants placed; the
//! engine places them and reports the outcome back through
//! [`SymbolController::record_fill`] or [`SymbolController::record_failure`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::accumulation::{AccumulationConfig, AccumulationLedger, EntryReason};
use super::positions::{ExitReason, ExitSignal, Position};
use crate::error::BotError;
use crate::models::{OrderRequest, PositionSide, PositionSnapshot, Side};
use crate::risk::{EntryBreaker, EntryTrip, RiskParams};
use crate::strategy::SignalUpdate;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HedgeConfig {
    pub enabled: bool,
    pub trigger_after_entries: u32, // Adverse entries before the hedge opens
    pub size_ratio: f64,            // Fraction of the main size
    pub take_profit_pct: Option<f64>,
    pub trend_exit: bool,  // Close the hedge once the trend turns back to the main side
    pub linked_exit: bool, // Hedge take-profit also closes the main position
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_after_entries: 2,
            size_ratio: 0.5,
            take_profit_pct: Some(3.0),
            trend_exit: true,
            linked_exit: false,
        }
    }
}

impl HedgeConfig {
    pub fn validate(&self) -> Result<(), BotError> {
        if !(self.size_ratio > 0.0 && self.size_ratio <= 1.0) {
            return Err(BotError::Config(format!(
                "hedge size_ratio must be in (0, 1], got {}",
                self.size_ratio
            )));
        }
        if self.enabled && self.trigger_after_entries < 1 {
            return Err(BotError::Config("hedge trigger_after_entries must be >= 1".into()));
        }
        if let Some(pct) = self.take_profit_pct {
            if pct <= 0.0 {
                return Err(BotError::Config(format!("hedge take_profit_pct must be > 0: {}", pct)));
            }
        }
        Ok(())
    }
}

/// Decision rules shared by every controller of a user
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerSettings {
    pub accumulation: AccumulationConfig,
    pub hedge: HedgeConfig,
    pub risk: RiskParams,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IntentKind {
    Entry { reason: EntryReason, index: usize },
    OpenHedge,
    Exit { reason: ExitReason },
}

/// An order the controller wants placed
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub symbol: String,
    pub pos_side: PositionSide,
    pub side: Side,
    pub quantity: f64,
    pub reduce_only: bool,
    pub kind: IntentKind,
}

impl OrderIntent {
    pub fn is_exit(&self) -> bool {
        matches!(self.kind, IntentKind::Exit { .. })
    }

    pub fn to_request(&self) -> OrderRequest {
        let request = OrderRequest::market(&self.symbol, self.side, self.quantity)
            .with_pos_side(self.pos_side);
        if self.reduce_only {
            request.reduce_only()
        } else {
            request
        }
    }
}

pub struct SymbolController {
    user: String,
    exchange: String,
    symbol: String,
    settings: Arc<ControllerSettings>,
    main: Option<Position>,
    hedge: Option<Position>,
    main_side: Option<PositionSide>,
    ledger: AccumulationLedger,
    signal: SignalUpdate,
    breaker: EntryBreaker,
    entry_pending: bool,
    hedge_requested: bool,
    orphan_hedge: bool, // Hedge left over from a main position that already closed
    last_price: Option<f64>,
}

impl SymbolController {
    pub fn new(user: &str, exchange: &str, symbol: &str, settings: Arc<ControllerSettings>) -> Self {
        let breaker = EntryBreaker::new(settings.risk.entry_block_cooldown());
        Self {
            user: user.to_string(),
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            settings,
            main: None,
            hedge: None,
            main_side: None,
            ledger: AccumulationLedger::new(),
            signal: SignalUpdate::neutral(symbol),
            breaker,
            entry_pending: false,
            hedge_requested: false,
            orphan_hedge: false,
            last_price: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn main(&self) -> Option<&Position> {
        self.main.as_ref()
    }

    pub fn hedge(&self) -> Option<&Position> {
        self.hedge.as_ref()
    }

    pub fn ledger(&self) -> &AccumulationLedger {
        &self.ledger
    }

    pub fn last_price(&self) -> Option<f64> {
        self.last_price
    }

    pub fn entries_blocked(&mut self, now: DateTime<Utc>) -> bool {
        self.breaker.check(now).is_err()
    }

    /// Apply an exchange position snapshot, then evaluate at its mark price
    pub fn on_position_snapshot(
        &mut self,
        snapshot: &PositionSnapshot,
        now: DateTime<Utc>,
    ) -> Vec<OrderIntent> {
        let is_main = match self.main_side {
            Some(side) => side == snapshot.side,
            None => snapshot.size > 0.0,
        };

        if is_main {
            self.apply_main_snapshot(snapshot, now);
        } else {
            self.apply_hedge_snapshot(snapshot);
        }

        if self.main.is_none() && self.hedge.is_none() {
            self.main_side = None;
        }

        match snapshot.mark_price {
            Some(mark) if mark > 0.0 => self.on_price(mark, now),
            _ => Vec::new(),
        }
    }

    fn apply_main_snapshot(&mut self, snapshot: &PositionSnapshot, now: DateTime<Utc>) {
        let risk = &self.settings.risk;
        match self.main.as_mut() {
            Some(position) => {
                position.update_from_exchange(snapshot, risk);
                if position.is_closed() {
                    tracing::info!(
                        user = %self.user,
                        symbol = %self.symbol,
                        entries = self.ledger.entry_count(),
                        "📉 Main {} position closed",
                        position.side
                    );
                    self.main = None;
                    self.ledger.clear();
                    self.entry_pending = false;
                    self.breaker.reset();
                    // A hedge still open from this cycle must not be reopened
                    self.hedge_requested = self.hedge.is_some();
                    self.orphan_hedge = self.hedge.is_some();
                }
            }
            None if snapshot.size > 0.0 => {
                let position = Position::open(&self.user, &self.exchange, snapshot, risk);
                if self.ledger.is_empty() {
                    self.ledger.record(
                        snapshot.entry_price,
                        snapshot.size,
                        EntryReason::InitialEntry,
                        now,
                    );
                }
                self.main_side = Some(snapshot.side);
                self.main = Some(position);
                self.hedge_requested = false;
            }
            None => {}
        }
    }

    fn apply_hedge_snapshot(&mut self, snapshot: &PositionSnapshot) {
        match self.hedge.as_mut() {
            Some(hedge) => {
                hedge.update_from_exchange(snapshot, &self.settings.risk);
                if hedge.is_closed() {
                    tracing::info!(user = %self.user, symbol = %self.symbol, "Hedge closed");
                    self.hedge = None;
                    self.hedge_requested = self.main.is_some() && !self.orphan_hedge;
                    self.orphan_hedge = false;
                }
            }
            None if snapshot.size > 0.0 => {
                let mut hedge = Position::without_levels(&self.user, &self.exchange, snapshot);
                if let Some(pct) = self.settings.hedge.take_profit_pct {
                    let target = snapshot.entry_price * (1.0 + snapshot.side.sign() * pct / 100.0);
                    hedge = hedge.with_levels(None, vec![(target, 1.0)]);
                }
                tracing::info!(
                    user = %self.user,
                    symbol = %self.symbol,
                    "🛡️ Hedge {} size={} @ ${:.4}",
                    hedge.side,
                    hedge.size,
                    hedge.entry_price
                );
                self.hedge = Some(hedge);
            }
            None => {}
        }
    }

    /// Evaluate exits, then entries, at a new price
    pub fn on_price(&mut self, price: f64, now: DateTime<Utc>) -> Vec<OrderIntent> {
        self.last_price = Some(price);
        if let Some(main) = self.main.as_mut() {
            main.update_trailing_stop(price);
        }

        let exits = self.evaluate_exits(price);
        if !exits.is_empty() {
            return exits;
        }
        self.evaluate_entries(price, now).into_iter().collect()
    }

    /// Store the latest upstream signal; the hedge's trend exit reacts at once
    pub fn on_signal(&mut self, signal: SignalUpdate) -> Vec<OrderIntent> {
        self.signal = signal;
        match self.hedge_trend_exit() {
            Some(intent) => vec![intent],
            None => Vec::new(),
        }
    }

    /// Exit precedence: main stop-loss, main trailing stop, hedge linked exit,
    /// main take-profit ladder, hedge own exits.
    fn evaluate_exits(&mut self, price: f64) -> Vec<OrderIntent> {
        let main_exit = self
            .main
            .as_ref()
            .filter(|m| !m.exit_pending)
            .and_then(|m| m.exit_signal(price));

        if let Some(signal) = main_exit {
            if matches!(signal.reason, ExitReason::StopLoss | ExitReason::TrailingStop) {
                return self.close_main(signal).into_iter().collect();
            }
        }

        let hedge_target_hit = self
            .hedge
            .as_ref()
            .filter(|h| !h.exit_pending)
            .and_then(|h| h.exit_signal(price))
            .is_some();

        if hedge_target_hit && self.settings.hedge.linked_exit && self.main.is_some() {
            tracing::info!(user = %self.user, symbol = %self.symbol, "🔗 Hedge target hit, linked exit");
            let mut intents = Vec::new();
            intents.extend(self.close_hedge(ExitReason::HedgeTakeProfit));
            if self.main.as_ref().map(|m| !m.exit_pending).unwrap_or(false) {
                intents.extend(self.close_main(ExitSignal::full(ExitReason::HedgeLinked)));
            }
            return intents;
        }

        if let Some(signal) = main_exit {
            return self.close_main(signal).into_iter().collect();
        }

        if hedge_target_hit {
            return self.close_hedge(ExitReason::HedgeTakeProfit).into_iter().collect();
        }
        self.hedge_trend_exit().into_iter().collect()
    }

    fn hedge_trend_exit(&mut self) -> Option<OrderIntent> {
        if !self.settings.hedge.trend_exit {
            return None;
        }
        let main_side = self.main_side?;
        let hedge = self.hedge.as_ref().filter(|h| !h.exit_pending)?;
        if hedge.side == main_side || !self.signal.trend.supports(main_side) {
            return None;
        }
        tracing::info!(
            user = %self.user,
            symbol = %self.symbol,
            trend = ?self.signal.trend,
            "Trend turned back to {}, closing hedge",
            main_side
        );
        self.close_hedge(ExitReason::HedgeTrendExit)
    }

    fn close_main(&mut self, signal: ExitSignal) -> Option<OrderIntent> {
        let main = self.main.as_mut()?;
        let quantity = main.size * signal.fraction;
        if quantity <= 0.0 {
            return None;
        }
        match signal.reason {
            ExitReason::TakeProfit { level } => main.mark_take_profit(level, true),
            _ => main.exit_pending = true,
        }
        if signal.fraction >= 1.0 {
            main.exit_pending = true;
        }

        tracing::info!(
            user = %self.user,
            symbol = %self.symbol,
            reason = ?signal.reason,
            "Closing {:.0}% of main {} ({} of {})",
            signal.fraction * 100.0,
            main.side,
            quantity,
            main.size
        );

        Some(OrderIntent {
            symbol: self.symbol.clone(),
            pos_side: main.side,
            side: main.side.exit_side(),
            quantity,
            reduce_only: true,
            kind: IntentKind::Exit {
                reason: signal.reason,
            },
        })
    }

    fn close_hedge(&mut self, reason: ExitReason) -> Option<OrderIntent> {
        let hedge = self.hedge.as_mut()?;
        hedge.exit_pending = true;
        Some(OrderIntent {
            symbol: self.symbol.clone(),
            pos_side: hedge.side,
            side: hedge.side.exit_side(),
            quantity: hedge.size,
            reduce_only: true,
            kind: IntentKind::Exit { reason },
        })
    }

    fn evaluate_entries(&mut self, price: f64, now: DateTime<Utc>) -> Option<OrderIntent> {
        if self.entry_pending {
            return None;
        }
        let (main_side, main_size) = match self.main.as_ref() {
            Some(main) if !main.exit_pending => (main.side, main.size),
            _ => return None,
        };
        if let Err(trip) = self.breaker.check(now) {
            tracing::debug!(symbol = %self.symbol, "Entries blocked: {:?}", trip);
            return None;
        }

        let hedge = &self.settings.hedge;
        if hedge.enabled
            && self.hedge.is_none()
            && !self.hedge_requested
            && self.ledger.adverse_entries() >= hedge.trigger_after_entries as usize
        {
            let pos_side = main_side.opposite();
            self.entry_pending = true;
            self.hedge_requested = true;
            tracing::info!(
                user = %self.user,
                symbol = %self.symbol,
                adverse_entries = self.ledger.adverse_entries(),
                "🛡️ Opening {} hedge",
                pos_side
            );
            return Some(OrderIntent {
                symbol: self.symbol.clone(),
                pos_side,
                side: pos_side.entry_side(),
                quantity: main_size * hedge.size_ratio,
                reduce_only: false,
                kind: IntentKind::OpenHedge,
            });
        }

        let planned = self
            .settings
            .accumulation
            .evaluate(&self.ledger, main_side, price, &self.signal)?;
        self.entry_pending = true;

        tracing::info!(
            user = %self.user,
            symbol = %self.symbol,
            index = planned.index,
            "💰 {:?} #{} triggered at ${:.4} (level ${:.4}), size {}",
            planned.reason,
            planned.index,
            price,
            planned.trigger,
            planned.quantity
        );

        Some(OrderIntent {
            symbol: self.symbol.clone(),
            pos_side: main_side,
            side: main_side.entry_side(),
            quantity: planned.quantity,
            reduce_only: false,
            kind: IntentKind::Entry {
                reason: planned.reason,
                index: planned.index,
            },
        })
    }

    /// The engine placed `intent` and it filled `quantity` at `price`
    pub fn record_fill(&mut self, intent: &OrderIntent, quantity: f64, price: f64, now: DateTime<Utc>) {
        match intent.kind {
            IntentKind::Entry { reason, .. } => {
                self.entry_pending = false;
                let index = self.ledger.record(price, quantity, reason, now).index;
                tracing::info!(
                    symbol = %self.symbol,
                    "Accumulated entry #{} {} @ ${:.4} (avg: ${:.4})",
                    index,
                    quantity,
                    price,
                    self.ledger.weighted_average().unwrap_or(price)
                );
            }
            IntentKind::OpenHedge => {
                self.entry_pending = false;
            }
            // Exit stays pending until the exchange reports the new size
            IntentKind::Exit { .. } => {}
        }
    }

    /// The engine could not place `intent`; undo its pending marks
    pub fn record_failure(&mut self, intent: &OrderIntent, error: &BotError, now: DateTime<Utc>) {
        match intent.kind {
            IntentKind::Entry { .. } => self.entry_pending = false,
            IntentKind::OpenHedge => {
                self.entry_pending = false;
                self.hedge_requested = false;
            }
            IntentKind::Exit { reason } => {
                let target = if Some(intent.pos_side) == self.main_side {
                    self.main.as_mut()
                } else {
                    self.hedge.as_mut()
                };
                if let Some(position) = target {
                    position.exit_pending = false;
                    if let ExitReason::TakeProfit { level } = reason {
                        position.mark_take_profit(level, false);
                    }
                }
            }
        }

        if let Some(trip) = EntryTrip::from_error(error) {
            self.breaker.trip(trip, now);
        }
    }
}
