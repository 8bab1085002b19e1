use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Direction of a derivatives position (hedge mode)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    pub fn opposite(&self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// Order side that grows this position
    pub fn entry_side(&self) -> Side {
        match self {
            PositionSide::Long => Side::Buy,
            PositionSide::Short => Side::Sell,
        }
    }

    /// Order side that reduces this position
    pub fn exit_side(&self) -> Side {
        self.entry_side().opposite()
    }

    /// +1 for long, -1 for short. Multiplies price moves into PnL direction.
    pub fn sign(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    PostOnly,
    Ioc,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::PostOnly => "post_only",
            OrderType::Ioc => "ioc",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "market" | "optimal_limit_ioc" => Some(OrderType::Market),
            "limit" => Some(OrderType::Limit),
            "post_only" => Some(OrderType::PostOnly),
            "ioc" | "fok" => Some(OrderType::Ioc),
            _ => None,
        }
    }

    /// Whether the order carries a limit price
    pub fn requires_price(&self) -> bool {
        !matches!(self, OrderType::Market)
    }
}

/// Lifecycle of an order as reported by the exchange
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Open | OrderStatus::PartiallyFilled
        )
    }

    pub fn is_final(&self) -> bool {
        !self.is_active()
    }

    /// Parse the exchange `state` field
    pub fn from_exchange_state(state: &str) -> Option<Self> {
        match state {
            "pending" => Some(OrderStatus::Pending),
            "live" => Some(OrderStatus::Open),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "filled" => Some(OrderStatus::Filled),
            "canceled" | "mmp_canceled" => Some(OrderStatus::Canceled),
            "rejected" => Some(OrderStatus::Rejected),
            "expired" => Some(OrderStatus::Expired),
            _ => None,
        }
    }
}

/// New order as submitted by the bot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub pos_side: Option<PositionSide>,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, amount: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            pos_side: None,
            order_type: OrderType::Market,
            amount,
            price: None,
            reduce_only: false,
            client_order_id: None,
        }
    }

    pub fn limit(symbol: &str, side: Side, amount: f64, price: f64) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            ..Self::market(symbol, side, amount)
        }
    }

    pub fn with_pos_side(mut self, pos_side: PositionSide) -> Self {
        self.pos_side = Some(pos_side);
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// Exchange acknowledgement of an accepted submission
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: Option<String>,
}

/// Normalized order update, from REST queries or the `orders` channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderReport {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub pos_side: Option<PositionSide>,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: Option<f64>,
    pub status: Option<OrderStatus>,
    pub filled_amount: f64,
    pub avg_price: Option<f64>,
    /// Cumulative fee for the order, positive = paid
    pub fee: f64,
    pub trade_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Exchange-reported position, the authority on size
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub leverage: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub mark_price: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticker {
    pub symbol: String,
    pub last: f64,
    pub timestamp: DateTime<Utc>,
}

/// OHLCV candlestick data
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Balance {
    pub currency: String,
    pub equity: f64,
    pub available: f64,
}

/// Trading rules of one instrument
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstrumentInfo {
    pub symbol: String,
    pub tick_size: f64,
    pub lot_size: f64,
    pub min_size: f64,
    pub contract_value: f64,
}

impl InstrumentInfo {
    /// Floor a size to the lot grid
    pub fn round_size(&self, size: f64) -> f64 {
        if self.lot_size <= 0.0 {
            return size;
        }
        // Nudge by a tiny epsilon so 0.3 / 0.1 does not floor to 2
        let lots = (size / self.lot_size + 1e-9).floor();
        lots * self.lot_size
    }

    /// Round a price to the tick grid
    pub fn round_price(&self, price: f64) -> f64 {
        if self.tick_size <= 0.0 {
            return price;
        }
        (price / self.tick_size).round() * self.tick_size
    }
}

/// API key material for one account
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("secret", &"***")
            .field("passphrase", &"***")
            .finish()
    }
}

/// Market trend state supplied by the upstream signal feed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrendState {
    StrongUp,
    Up,
    #[default]
    Neutral,
    Down,
    StrongDown,
}

impl TrendState {
    /// True when the trend strongly runs against the given position direction
    pub fn strongly_opposes(&self, side: PositionSide) -> bool {
        matches!(
            (self, side),
            (TrendState::StrongDown, PositionSide::Long) | (TrendState::StrongUp, PositionSide::Short)
        )
    }

    /// True when the trend points the same way as the position
    pub fn supports(&self, side: PositionSide) -> bool {
        matches!(
            (self, side),
            (TrendState::StrongUp | TrendState::Up, PositionSide::Long)
                | (TrendState::StrongDown | TrendState::Down, PositionSide::Short)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        for status in [OrderStatus::Pending, OrderStatus::Open, OrderStatus::PartiallyFilled] {
            assert!(status.is_active());
            assert!(!status.is_final());
        }
        for status in [
            OrderStatus::Filled,
            OrderStatus::Canceled,
            OrderStatus::Rejected,
            OrderStatus::Expired,
        ] {
            assert!(status.is_final());
        }
    }

    #[test]
    fn test_exchange_state_parsing() {
        assert_eq!(OrderStatus::from_exchange_state("live"), Some(OrderStatus::Open));
        assert_eq!(
            OrderStatus::from_exchange_state("partially_filled"),
            Some(OrderStatus::PartiallyFilled)
        );
        assert_eq!(OrderStatus::from_exchange_state("mmp_canceled"), Some(OrderStatus::Canceled));
        assert_eq!(OrderStatus::from_exchange_state("bogus"), None);
    }

    #[test]
    fn test_position_side_helpers() {
        assert_eq!(PositionSide::Long.entry_side(), Side::Buy);
        assert_eq!(PositionSide::Long.exit_side(), Side::Sell);
        assert_eq!(PositionSide::Short.entry_side(), Side::Sell);
        assert_eq!(PositionSide::Short.opposite(), PositionSide::Long);
    }

    #[test]
    fn test_round_size_to_lot() {
        let info = InstrumentInfo {
            symbol: "BTC-USDT-SWAP".to_string(),
            tick_size: 0.1,
            lot_size: 0.1,
            min_size: 0.1,
            contract_value: 0.01,
        };
        assert!((info.round_size(0.3) - 0.3).abs() < 1e-9);
        assert!((info.round_size(0.37) - 0.3).abs() < 1e-9);
        assert!((info.round_price(100.04) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_trend_opposition() {
        assert!(TrendState::StrongDown.strongly_opposes(PositionSide::Long));
        assert!(!TrendState::Down.strongly_opposes(PositionSide::Long));
        assert!(TrendState::StrongUp.strongly_opposes(PositionSide::Short));
        assert!(TrendState::Up.supports(PositionSide::Long));
        assert!(!TrendState::Neutral.supports(PositionSide::Short));
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = Credentials {
            api_key: "key".to_string(),
            secret: "topsecret".to_string(),
            passphrase: "pass".to_string(),
        };
        let shown = format!("{:?}", creds);
        assert!(shown.contains("key"));
        assert!(!shown.contains("topsecret"));
    }
}
