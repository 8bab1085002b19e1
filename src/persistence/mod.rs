//! Shared state store adapter.
//!
//! The store is a coordination hint shared across processes: which symbols a
//! user wants traded, which users have a live feed, and cached instrument
//! rules. It is never consulted for balances or fills.

pub mod instruments;
pub mod memory;
pub mod redis_store;

pub use instruments::InstrumentCache;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::execution::orders::Order;
use crate::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};

/// Key/value, hash and set operations used by the bot
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>>;
}

pub fn active_symbols_key(exchange: &str, user: &str) -> String {
    format!("active_symbols:{}:{}", exchange, user)
}

pub fn running_key(exchange: &str) -> String {
    format!("running:{}", exchange)
}

pub fn instrument_key(exchange: &str, symbol: &str) -> String {
    format!("instrument:{}:{}", exchange, symbol)
}

/// Symbols the user wants traded on this exchange
pub async fn active_symbols(
    store: &dyn SharedStore,
    exchange: &str,
    user: &str,
) -> Result<BTreeSet<String>> {
    store.smembers(&active_symbols_key(exchange, user)).await
}

pub async fn activate_symbol(
    store: &dyn SharedStore,
    exchange: &str,
    user: &str,
    symbol: &str,
) -> Result<()> {
    store.sadd(&active_symbols_key(exchange, user), symbol).await
}

pub async fn deactivate_symbol(
    store: &dyn SharedStore,
    exchange: &str,
    user: &str,
    symbol: &str,
) -> Result<()> {
    store.srem(&active_symbols_key(exchange, user), symbol).await
}

/// Record whether a feed task is alive for the user
pub async fn set_running(
    store: &dyn SharedStore,
    exchange: &str,
    user: &str,
    running: bool,
) -> Result<()> {
    let key = running_key(exchange);
    if running {
        store.sadd(&key, user).await
    } else {
        store.srem(&key, user).await
    }
}

pub async fn running_users(store: &dyn SharedStore, exchange: &str) -> Result<BTreeSet<String>> {
    store.smembers(&running_key(exchange)).await
}

/// Receives orders that reached a terminal state with their fees settled
pub trait TradeRecorder: Send + Sync {
    fn record(&self, user: &str, order: &Order);
}

/// Recorder that only logs finalized trades
pub struct LogRecorder;

impl TradeRecorder for LogRecorder {
    fn record(&self, user: &str, order: &Order) {
        tracing::info!(
            user = %user,
            symbol = %order.symbol,
            order_id = %order.order_id,
            status = ?order.status,
            filled = order.filled_amount,
            avg_price = order.avg_price.unwrap_or(0.0),
            fee = order.fee,
            "Trade finalized"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_active_symbol_helpers() {
        let store = MemoryStore::new();

        activate_symbol(&store, "okx", "u1", "BTC-USDT-SWAP").await.unwrap();
        activate_symbol(&store, "okx", "u1", "ETH-USDT-SWAP").await.unwrap();
        activate_symbol(&store, "okx", "u2", "SOL-USDT-SWAP").await.unwrap();
        deactivate_symbol(&store, "okx", "u1", "ETH-USDT-SWAP").await.unwrap();

        let symbols = active_symbols(&store, "okx", "u1").await.unwrap();
        assert_eq!(symbols.into_iter().collect::<Vec<_>>(), vec!["BTC-USDT-SWAP"]);
    }

    #[tokio::test]
    async fn test_running_marker() {
        let store = MemoryStore::new();

        set_running(&store, "okx", "u1", true).await.unwrap();
        assert!(running_users(&store, "okx").await.unwrap().contains("u1"));

        set_running(&store, "okx", "u1", false).await.unwrap();
        assert!(running_users(&store, "okx").await.unwrap().is_empty());
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(active_symbols_key("okx", "7"), "active_symbols:okx:7");
        assert_eq!(running_key("okx"), "running:okx");
        assert_eq!(instrument_key("okx", "BTC-USDT-SWAP"), "instrument:okx:BTC-USDT-SWAP");
    }
}
