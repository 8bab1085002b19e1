use super::{instrument_key, SharedStore};
use crate::api::wire::parse_opt_num;
use crate::api::ExchangeClient;
use crate::models::InstrumentInfo;
use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Read-through cache of instrument precision and minimum order size.
///
/// Lookup order: process memory, shared store, then the exchange. Values
/// fetched from the exchange are written back to the store for other processes.
pub struct InstrumentCache {
    store: Arc<dyn SharedStore>,
    client: Arc<dyn ExchangeClient>,
    local: RwLock<HashMap<String, InstrumentInfo>>,
}

impl InstrumentCache {
    pub fn new(store: Arc<dyn SharedStore>, client: Arc<dyn ExchangeClient>) -> Self {
        Self {
            store,
            client,
            local: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, symbol: &str) -> Result<InstrumentInfo> {
        if let Some(info) = self
            .local
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(symbol)
        {
            return Ok(info.clone());
        }

        let key = instrument_key(self.client.exchange(), symbol);
        let info = match self.load_from_store(&key, symbol).await {
            Some(info) => info,
            None => {
                let info = self.client.get_instrument(symbol).await?;
                self.write_to_store(&key, &info).await;
                info
            }
        };

        self.local
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(symbol.to_string(), info.clone());
        Ok(info)
    }

    /// Forget a cached entry, e.g. after the exchange changed lot rules
    pub fn invalidate(&self, symbol: &str) {
        self.local
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(symbol);
    }

    async fn load_from_store(&self, key: &str, symbol: &str) -> Option<InstrumentInfo> {
        let fields = match self.store.hgetall(key).await {
            Ok(fields) => fields,
            Err(e) => {
                tracing::warn!(symbol = %symbol, "Instrument cache read failed: {}", e);
                return None;
            }
        };
        let field = |name: &str| fields.get(name).and_then(|v| parse_opt_num(v));

        Some(InstrumentInfo {
            symbol: symbol.to_string(),
            tick_size: field("tick_size")?,
            lot_size: field("lot_size")?,
            min_size: field("min_size")?,
            contract_value: field("ct_val").unwrap_or(1.0),
        })
    }

    async fn write_to_store(&self, key: &str, info: &InstrumentInfo) {
        let fields = [
            ("tick_size", info.tick_size),
            ("lot_size", info.lot_size),
            ("min_size", info.min_size),
            ("ct_val", info.contract_value),
        ];
        for (field, value) in fields {
            if let Err(e) = self.store.hset(key, field, &value.to_string()).await {
                // The store is only a hint; the lookup already succeeded
                tracing::warn!(symbol = %info.symbol, "Instrument cache write failed: {}", e);
                return;
            }
        }
    }
}
