// Upstream signal input
//
// Indicator math (RSI, trend, ATR) lives outside the bot. Producers publish
// their latest reading per symbol into the shared store; the bot only reads it.

use crate::api::wire::parse_opt_num;
use crate::models::{PositionSide, TrendState};
use crate::persistence::SharedStore;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Latest indicator reading for one symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalUpdate {
    pub symbol: String,
    pub rsi_confirms_long: bool,  // RSI oversold, supports adding to longs
    pub rsi_confirms_short: bool, // RSI overbought, supports adding to shorts
    pub trend: TrendState,
    pub atr: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl SignalUpdate {
    /// Neutral reading used before any signal arrived
    pub fn neutral(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            rsi_confirms_long: false,
            rsi_confirms_short: false,
            trend: TrendState::Neutral,
            atr: None,
            timestamp: Utc::now(),
        }
    }

    pub fn rsi_confirms(&self, side: PositionSide) -> bool {
        match side {
            PositionSide::Long => self.rsi_confirms_long,
            PositionSide::Short => self.rsi_confirms_short,
        }
    }
}

pub fn signal_key(exchange: &str, symbol: &str) -> String {
    format!("signal:{}:{}", exchange, symbol)
}

/// Read the published signal for a symbol, None when nothing was published
pub async fn read_signal(
    store: &dyn SharedStore,
    exchange: &str,
    symbol: &str,
) -> Result<Option<SignalUpdate>> {
    let fields = store.hgetall(&signal_key(exchange, symbol)).await?;
    if fields.is_empty() {
        return Ok(None);
    }

    let flag = |name: &str| {
        fields
            .get(name)
            .map(|v| matches!(v.as_str(), "1" | "true"))
            .unwrap_or(false)
    };
    let trend = fields
        .get("trend")
        .and_then(|v| serde_json::from_value(serde_json::Value::String(v.clone())).ok())
        .unwrap_or_default();
    let timestamp = fields
        .get("ts")
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    Ok(Some(SignalUpdate {
        symbol: symbol.to_string(),
        rsi_confirms_long: flag("rsi_long"),
        rsi_confirms_short: flag("rsi_short"),
        trend,
        atr: fields.get("atr").and_then(|v| parse_opt_num(v)),
        timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    #[tokio::test]
    async fn test_read_published_signal() {
        let store = MemoryStore::new();
        let key = signal_key("okx", "BTC-USDT-SWAP");
        store.hset(&key, "rsi_long", "1").await.unwrap();
        store.hset(&key, "trend", "strong_down").await.unwrap();
        store.hset(&key, "atr", "250.5").await.unwrap();

        let signal = read_signal(&store, "okx", "BTC-USDT-SWAP").await.unwrap().unwrap();
        assert!(signal.rsi_confirms(PositionSide::Long));
        assert!(!signal.rsi_confirms(PositionSide::Short));
        assert_eq!(signal.trend, TrendState::StrongDown);
        assert_eq!(signal.atr, Some(250.5));
    }

    #[tokio::test]
    async fn test_missing_signal_is_none() {
        let store = MemoryStore::new();
        assert!(read_signal(&store, "okx", "ETH-USDT-SWAP").await.unwrap().is_none());
    }
}
