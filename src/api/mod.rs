pub mod mock;
pub mod okx;
pub mod signing;
pub mod wire;

pub use mock::MockExchange;
pub use okx::OkxRestClient;

use crate::models::{
    Balance, Candle, Credentials, InstrumentInfo, OrderAck, OrderReport, OrderRequest,
    PositionSnapshot, Ticker,
};
use crate::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Request/response access to one exchange account
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Exchange identifier used in shared-store keys
    fn exchange(&self) -> &str;

    async fn get_balance(&self, currency: &str) -> Result<Balance>;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()>;

    /// Bulk cancel of `(symbol, order_id)` pairs.
    ///
    /// Returns the ids that were canceled; fails only when nothing was.
    async fn cancel_orders(&self, orders: &[(String, String)]) -> Result<Vec<String>>;

    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<OrderReport>;

    async fn get_pending_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderReport>>;

    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<PositionSnapshot>>;

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker>;

    async fn get_candles(&self, symbol: &str, bar: &str, limit: usize) -> Result<Vec<Candle>>;

    async fn get_instrument(&self, symbol: &str) -> Result<InstrumentInfo>;
}

/// Stable identity of a credential set, safe to log and use as a map key
pub fn credential_fingerprint(credentials: &Credentials) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credentials.api_key.as_bytes());
    hasher.update(b":");
    hasher.update(credentials.passphrase.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// Explicit open/close registry of exchange clients, one per credential set
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, Arc<dyn ExchangeClient>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the client for these credentials, building it on first use
    pub fn open<F>(&self, credentials: &Credentials, build: F) -> Arc<dyn ExchangeClient>
    where
        F: FnOnce(&Credentials) -> Arc<dyn ExchangeClient>,
    {
        let key = credential_fingerprint(credentials);
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::info!(client = %key, "Opened exchange client");
                build(credentials)
            })
            .clone()
    }

    /// Drop the registry's handle. Returns false if it was not open.
    pub fn close(&self, credentials: &Credentials) -> bool {
        let key = credential_fingerprint(credentials);
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let removed = clients.remove(&key).is_some();
        if removed {
            tracing::info!(client = %key, "Closed exchange client");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(key: &str) -> Credentials {
        Credentials {
            api_key: key.to_string(),
            secret: "s".to_string(),
            passphrase: "p".to_string(),
        }
    }

    #[test]
    fn test_registry_reuses_client_per_credentials() {
        let registry = ClientRegistry::new();
        let mut builds = 0;

        let a = registry.open(&creds("a"), |_| {
            builds += 1;
            Arc::new(MockExchange::new())
        });
        let b = registry.open(&creds("a"), |_| {
            builds += 1;
            Arc::new(MockExchange::new())
        });

        assert_eq!(builds, 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_close() {
        let registry = ClientRegistry::new();
        registry.open(&creds("a"), |_| Arc::new(MockExchange::new()));
        registry.open(&creds("b"), |_| Arc::new(MockExchange::new()));

        assert!(registry.close(&creds("a")));
        assert!(!registry.close(&creds("a")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_fingerprint_ignores_secret() {
        let mut other = creds("a");
        other.secret = "different".to_string();
        assert_eq!(credential_fingerprint(&creds("a")), credential_fingerprint(&other));
        assert_ne!(credential_fingerprint(&creds("a")), credential_fingerprint(&creds("b")));
    }
}
