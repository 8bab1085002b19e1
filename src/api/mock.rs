//! In-process exchange double for tests and dry runs.
//!
//! Market orders fill immediately at the configured ticker price, other
//! orders rest as `live` until canceled or filled through [`MockExchange::fill`].

use super::ExchangeClient;
use crate::error::BotError;
use crate::models::{
    Balance, Candle, InstrumentInfo, OrderAck, OrderReport, OrderRequest, OrderStatus,
    OrderType, PositionSnapshot, Ticker,
};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct MockState {
    next_id: u64,
    orders: HashMap<String, OrderReport>,
    placed: Vec<OrderRequest>,
    prices: HashMap<String, f64>,
    positions: Vec<PositionSnapshot>,
    instruments: HashMap<String, InstrumentInfo>,
    available: f64,
    reject_next_place: Option<(String, String)>,
    fail_cancel: bool,
    fail_bulk_cancel: bool,
}

pub struct MockExchange {
    state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_id: 1,
                available: 10_000.0,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.state().prices.insert(symbol.to_string(), price);
    }

    pub fn set_positions(&self, positions: Vec<PositionSnapshot>) {
        self.state().positions = positions;
    }

    pub fn set_instrument(&self, info: InstrumentInfo) {
        self.state().instruments.insert(info.symbol.clone(), info);
    }

    /// Reject the next placement with the given exchange code
    pub fn reject_next_place(&self, code: &str, message: &str) {
        self.state().reject_next_place = Some((code.to_string(), message.to_string()));
    }

    pub fn fail_cancels(&self, fail: bool) {
        self.state().fail_cancel = fail;
    }

    pub fn fail_bulk_cancels(&self, fail: bool) {
        self.state().fail_bulk_cancel = fail;
    }

    /// Every request accepted so far, in submission order
    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        self.state().placed.clone()
    }

    /// Fill a resting order, as the exchange would after a trade
    pub fn fill(&self, order_id: &str, filled: f64, price: f64) -> Option<OrderReport> {
        let mut state = self.state();
        let order = state.orders.get_mut(order_id)?;
        order.filled_amount = filled.min(order.amount);
        order.avg_price = Some(price);
        order.status = Some(if order.filled_amount >= order.amount {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        });
        order.updated_at = Utc::now();
        Some(order.clone())
    }

    fn cancel_one(state: &mut MockState, order_id: &str) -> Result<()> {
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BotError::NotFound(format!("order {}", order_id)))?;
        match order.status {
            Some(status) if status.is_final() => Err(BotError::OrderRejected {
                code: "51400".to_string(),
                message: "order already completed".to_string(),
            }),
            _ => {
                order.status = Some(OrderStatus::Canceled);
                order.updated_at = Utc::now();
                Ok(())
            }
        }
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    fn exchange(&self) -> &str {
        "mock"
    }

    async fn get_balance(&self, currency: &str) -> Result<Balance> {
        let available = self.state().available;
        Ok(Balance {
            currency: currency.to_string(),
            equity: available,
            available,
        })
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let mut state = self.state();
        if let Some((code, message)) = state.reject_next_place.take() {
            return Err(BotError::from_exchange_code(&code, &message));
        }

        let order_id = state.next_id.to_string();
        state.next_id += 1;

        let market_price = state.prices.get(&request.symbol).copied();
        let (status, filled, avg_price) = match request.order_type {
            OrderType::Market => (
                OrderStatus::Filled,
                request.amount,
                market_price.or(request.price),
            ),
            _ => (OrderStatus::Open, 0.0, None),
        };

        state.orders.insert(
            order_id.clone(),
            OrderReport {
                order_id: order_id.clone(),
                client_order_id: request.client_order_id.clone(),
                symbol: request.symbol.clone(),
                side: request.side,
                pos_side: request.pos_side,
                order_type: request.order_type,
                amount: request.amount,
                price: request.price,
                status: Some(status),
                filled_amount: filled,
                avg_price,
                fee: 0.0,
                trade_id: None,
                updated_at: Utc::now(),
            },
        );
        state.placed.push(request.clone());

        Ok(OrderAck {
            order_id,
            client_order_id: request.client_order_id.clone(),
        })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_cancel {
            return Err(BotError::TransientNetwork("cancel unavailable".into()));
        }
        Self::cancel_one(&mut state, order_id)
    }

    async fn cancel_orders(&self, orders: &[(String, String)]) -> Result<Vec<String>> {
        let mut state = self.state();
        if state.fail_bulk_cancel {
            return Err(BotError::TransientNetwork("batch cancel unavailable".into()));
        }
        let canceled: Vec<String> = orders
            .iter()
            .filter(|(_, id)| Self::cancel_one(&mut state, id).is_ok())
            .map(|(_, id)| id.clone())
            .collect();
        if canceled.is_empty() && !orders.is_empty() {
            return Err(BotError::OrderRejected {
                code: "51400".to_string(),
                message: "nothing canceled".to_string(),
            });
        }
        Ok(canceled)
    }

    async fn get_order(&self, _symbol: &str, order_id: &str) -> Result<OrderReport> {
        self.state()
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| BotError::NotFound(format!("order {}", order_id)))
    }

    async fn get_pending_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderReport>> {
        Ok(self
            .state()
            .orders
            .values()
            .filter(|o| o.status.map(|s| s.is_active()).unwrap_or(true))
            .filter(|o| symbol.map(|s| o.symbol == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<PositionSnapshot>> {
        Ok(self
            .state()
            .positions
            .iter()
            .filter(|p| symbol.map(|s| p.symbol == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        let last = self
            .state()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| BotError::NotFound(format!("ticker {}", symbol)))?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            last,
            timestamp: Utc::now(),
        })
    }

    async fn get_candles(&self, _symbol: &str, _bar: &str, _limit: usize) -> Result<Vec<Candle>> {
        Ok(Vec::new())
    }

    async fn get_instrument(&self, symbol: &str) -> Result<InstrumentInfo> {
        Ok(self
            .state()
            .instruments
            .get(symbol)
            .cloned()
            .unwrap_or(InstrumentInfo {
                symbol: symbol.to_string(),
                tick_size: 0.01,
                lot_size: 0.01,
                min_size: 0.01,
                contract_value: 1.0,
            }))
    }
}
