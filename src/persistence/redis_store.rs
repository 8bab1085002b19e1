use super::SharedStore;
use crate::error::BotError;
use crate::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::{BTreeSet, HashMap};
use tokio::time::{timeout, Duration};

/// Redis-backed shared store
///
/// `ConnectionManager` reconnects on its own; each call works on a cheap clone.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `connect_timeout` - Give up if the first connection takes longer
    pub async fn new(redis_url: &str, connect_timeout: Duration) -> Result<Self> {
        let client = Client::open(redis_url)?;

        let conn = timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                BotError::Store(format!(
                    "Redis connection timeout after {} seconds",
                    connect_timeout.as_secs()
                ))
            })??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget::<_, _, Option<String>>(key, field).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall::<_, HashMap<String, String>>(key).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers::<_, BTreeSet<String>>(key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{activate_symbol, active_symbols, deactivate_symbol};

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_connection_timeout() {
        // Try to connect to non-existent Redis
        let result = RedisStore::new("redis://192.0.2.1:6379", Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_active_symbols_roundtrip() {
        let store = RedisStore::new("redis://127.0.0.1:6379", Duration::from_secs(5))
            .await
            .expect("Failed to connect to Redis");

        // Clean up first
        let _ = store.del("active_symbols:test:u1").await;

        activate_symbol(&store, "test", "u1", "BTC-USDT-SWAP").await.unwrap();
        activate_symbol(&store, "test", "u1", "ETH-USDT-SWAP").await.unwrap();
        deactivate_symbol(&store, "test", "u1", "BTC-USDT-SWAP").await.unwrap();

        let symbols = active_symbols(&store, "test", "u1").await.unwrap();
        assert_eq!(symbols.len(), 1);
        assert!(symbols.contains("ETH-USDT-SWAP"));

        // Cleanup
        let _ = store.del("active_symbols:test:u1").await;
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_hash_fields() {
        let store = RedisStore::new("redis://127.0.0.1:6379", Duration::from_secs(5))
            .await
            .expect("Failed to connect to Redis");

        let _ = store.del("instrument:test:X").await;
        store.hset("instrument:test:X", "lot_size", "0.1").await.unwrap();

        let fields = store.hgetall("instrument:test:X").await.unwrap();
        assert_eq!(fields.get("lot_size").map(String::as_str), Some("0.1"));

        let _ = store.del("instrument:test:X").await;
    }
}
