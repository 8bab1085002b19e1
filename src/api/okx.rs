use super::wire::{
    self, Envelope, RawAck, RawBalance, RawInstrument, RawOrder, RawPosition, RawTicker,
};
use super::{signing, ExchangeClient};
use crate::error::BotError;
use crate::models::{
    Balance, Candle, Credentials, InstrumentInfo, OrderAck, OrderReport, OrderRequest,
    PositionSnapshot, Ticker,
};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use governor::{Quota, RateLimiter};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::num::NonZeroU32;
use std::sync::Arc;

pub const OKX_REST_URL: &str = "https://www.okx.com";

/// Batch cancel accepts at most this many orders per call
const CANCEL_BATCH_LIMIT: usize = 20;

type DirectLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Signed REST client for the OKX v5 API
#[derive(Clone)]
pub struct OkxRestClient {
    http: Client,
    base_url: String,
    credentials: Credentials,
    inst_type: String,
    td_mode: String,
    simulated: bool,
    rate_limiter: Arc<DirectLimiter>,
}

impl OkxRestClient {
    /// Create a client with the default 10 requests per second budget
    pub fn new(credentials: Credentials) -> Self {
        Self {
            http: Client::new(),
            base_url: OKX_REST_URL.to_string(),
            credentials,
            inst_type: "SWAP".to_string(),
            td_mode: "cross".to_string(),
            simulated: false,
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(
                NonZeroU32::new(10).unwrap_or(NonZeroU32::MIN),
            ))),
        }
    }

    /// Sets a custom base URL (useful for testing)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_rate_limit(mut self, requests_per_second: u32) -> Self {
        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        self.rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rate)));
        self
    }

    /// Route requests to the demo trading environment
    pub fn simulated(mut self, simulated: bool) -> Self {
        self.simulated = simulated;
        self
    }

    pub fn with_inst_type(mut self, inst_type: impl Into<String>) -> Self {
        self.inst_type = inst_type.into();
        self
    }

    pub fn with_td_mode(mut self, td_mode: impl Into<String>) -> Self {
        self.td_mode = td_mode.into();
        self
    }

    /// Issue one signed request and unwrap the response envelope.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Vec<T>> {
        let envelope: Envelope<T> = self.send(method, path, body).await?;
        envelope.into_result()
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Envelope<T>> {
        self.rate_limiter.until_ready().await;

        let body_text = match body {
            Some(value) => serde_json::to_string(value)?,
            None => String::new(),
        };
        let timestamp = signing::rest_timestamp(Utc::now());
        let signature = signing::sign_rest(
            &self.credentials.secret,
            &timestamp,
            method.as_str(),
            path,
            &body_text,
        );

        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("{} {}", method, url);

        let mut builder = self
            .http
            .request(method, &url)
            .header("OK-ACCESS-KEY", &self.credentials.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", &self.credentials.passphrase)
            .header("Content-Type", "application/json");
        if self.simulated {
            builder = builder.header("x-simulated-trading", "1");
        }
        if !body_text.is_empty() {
            builder = builder.body(body_text);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        match serde_json::from_str::<Envelope<T>>(&text) {
            Ok(envelope) => Ok(envelope),
            Err(_) if status.is_server_error() || status.as_u16() == 429 => Err(
                BotError::TransientNetwork(format!("HTTP {}: {}", status, text)),
            ),
            Err(_) if status.as_u16() == 401 => Err(BotError::Authentication(text)),
            Err(e) if status.is_success() => Err(BotError::MalformedMessage(e.to_string())),
            Err(_) => Err(BotError::OrderRejected {
                code: status.as_u16().to_string(),
                message: text,
            }),
        }
    }

    /// JSON body for a new order
    pub(crate) fn order_body(&self, request: &OrderRequest) -> Value {
        let mut body = Map::new();
        body.insert("instId".into(), json!(request.symbol));
        body.insert("tdMode".into(), json!(self.td_mode));
        body.insert("side".into(), json!(request.side.as_str()));
        if let Some(pos_side) = request.pos_side {
            body.insert("posSide".into(), json!(pos_side.as_str()));
        }
        body.insert("ordType".into(), json!(request.order_type.as_str()));
        body.insert("sz".into(), json!(wire::format_num(request.amount)));
        if let Some(price) = request.price {
            body.insert("px".into(), json!(wire::format_num(price)));
        }
        if request.reduce_only {
            body.insert("reduceOnly".into(), json!(true));
        }
        if let Some(ref client_id) = request.client_order_id {
            body.insert("clOrdId".into(), json!(client_id));
        }
        Value::Object(body)
    }
}

#[async_trait]
impl ExchangeClient for OkxRestClient {
    fn exchange(&self) -> &str {
        "okx"
    }

    async fn get_balance(&self, currency: &str) -> Result<Balance> {
        let path = format!("/api/v5/account/balance?ccy={}", currency);
        let data: Vec<RawBalance> = self.request(Method::GET, &path, None).await?;

        data.into_iter()
            .flat_map(|b| b.details)
            .find(|d| d.ccy == currency)
            .map(Balance::from)
            .ok_or_else(|| BotError::NotFound(format!("no {} balance", currency)))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let body = self.order_body(request);
        let envelope: Envelope<RawAck> = self
            .send(Method::POST, "/api/v5/trade/order", Some(&body))
            .await?;
        let (code, msg) = (envelope.code, envelope.msg);

        // The per-item code is more specific than the envelope code
        let ack = match envelope.data.into_iter().next() {
            Some(ack) => ack,
            None if code != "0" => return Err(BotError::from_exchange_code(&code, &msg)),
            None => {
                return Err(BotError::MalformedMessage("empty order acknowledgement".into()))
            }
        };
        ack.check()?;
        if code != "0" {
            return Err(BotError::from_exchange_code(&code, &msg));
        }

        tracing::info!(
            symbol = %request.symbol,
            order_id = %ack.ord_id,
            side = request.side.as_str(),
            size = request.amount,
            "Order accepted"
        );

        Ok(OrderAck {
            order_id: ack.ord_id,
            client_order_id: if ack.cl_ord_id.is_empty() {
                request.client_order_id.clone()
            } else {
                Some(ack.cl_ord_id)
            },
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let body = json!({ "instId": symbol, "ordId": order_id });
        let data: Vec<RawAck> = self
            .request(Method::POST, "/api/v5/trade/cancel-order", Some(&body))
            .await?;
        match data.first() {
            Some(ack) => ack.check(),
            None => Err(BotError::MalformedMessage("empty cancel acknowledgement".into())),
        }
    }

    async fn cancel_orders(&self, orders: &[(String, String)]) -> Result<Vec<String>> {
        let mut canceled = Vec::new();
        let mut first_error = None;

        for chunk in orders.chunks(CANCEL_BATCH_LIMIT) {
            let body = Value::Array(
                chunk
                    .iter()
                    .map(|(symbol, id)| json!({ "instId": symbol, "ordId": id }))
                    .collect(),
            );
            let envelope: Envelope<RawAck> = match self
                .send(Method::POST, "/api/v5/trade/cancel-batch-orders", Some(&body))
                .await
            {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(orders = chunk.len(), "Batch cancel chunk failed: {}", e);
                    first_error.get_or_insert(e);
                    continue;
                }
            };

            // "1" = all failed, "2" = partial success; both still carry per-item results
            if !matches!(envelope.code.as_str(), "0" | "1" | "2") {
                first_error.get_or_insert(BotError::from_exchange_code(
                    &envelope.code,
                    &envelope.msg,
                ));
                continue;
            }
            for ack in envelope.data {
                match ack.check() {
                    Ok(()) => canceled.push(ack.ord_id),
                    Err(e) => {
                        tracing::warn!(order_id = %ack.ord_id, "Batch cancel item failed: {}", e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) if canceled.is_empty() => Err(e),
            _ => Ok(canceled),
        }
    }

    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<OrderReport> {
        let path = format!("/api/v5/trade/order?instId={}&ordId={}", symbol, order_id);
        let data: Vec<RawOrder> = self.request(Method::GET, &path, None).await?;
        data.into_iter()
            .next()
            .ok_or_else(|| BotError::NotFound(format!("order {}", order_id)))?
            .into_report()
    }

    async fn get_pending_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderReport>> {
        let mut path = format!("/api/v5/trade/orders-pending?instType={}", self.inst_type);
        if let Some(symbol) = symbol {
            path.push_str(&format!("&instId={}", symbol));
        }
        let data: Vec<RawOrder> = self.request(Method::GET, &path, None).await?;
        Ok(skip_malformed(data, RawOrder::into_report))
    }

    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<PositionSnapshot>> {
        let mut path = format!("/api/v5/account/positions?instType={}", self.inst_type);
        if let Some(symbol) = symbol {
            path.push_str(&format!("&instId={}", symbol));
        }
        let data: Vec<RawPosition> = self.request(Method::GET, &path, None).await?;
        Ok(skip_malformed(data, RawPosition::into_snapshot))
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        let path = format!("/api/v5/market/ticker?instId={}", symbol);
        let data: Vec<RawTicker> = self.request(Method::GET, &path, None).await?;
        data.into_iter()
            .next()
            .ok_or_else(|| BotError::NotFound(format!("ticker {}", symbol)))?
            .into_ticker()
    }

    async fn get_candles(&self, symbol: &str, bar: &str, limit: usize) -> Result<Vec<Candle>> {
        let path = format!(
            "/api/v5/market/candles?instId={}&bar={}&limit={}",
            symbol, bar, limit
        );
        let rows: Vec<Vec<String>> = self.request(Method::GET, &path, None).await?;

        // Newest first on the wire, oldest first for callers
        let mut candles = rows
            .iter()
            .map(|row| wire::parse_candle(symbol, row))
            .collect::<Result<Vec<_>>>()?;
        candles.reverse();
        Ok(candles)
    }

    async fn get_instrument(&self, symbol: &str) -> Result<InstrumentInfo> {
        let path = format!(
            "/api/v5/public/instruments?instType={}&instId={}",
            self.inst_type, symbol
        );
        let data: Vec<RawInstrument> = self.request(Method::GET, &path, None).await?;
        data.into_iter()
            .next()
            .map(InstrumentInfo::from)
            .ok_or_else(|| BotError::NotFound(format!("instrument {}", symbol)))
    }
}

fn skip_malformed<R, T>(records: Vec<R>, convert: fn(R) -> Result<T>) -> Vec<T> {
    records
        .into_iter()
        .filter_map(|record| match convert(record) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Skipping malformed record: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, PositionSide, Side};
    use mockito::Matcher;

    fn test_credentials() -> Credentials {
        Credentials {
            api_key: "test-key".to_string(),
            secret: "test-secret".to_string(),
            passphrase: "test-pass".to_string(),
        }
    }

    fn client_for(server: &mockito::ServerGuard) -> OkxRestClient {
        OkxRestClient::new(test_credentials())
            .with_base_url(server.url())
            .with_rate_limit(1000)
    }

    #[tokio::test]
    async fn test_signed_headers_present() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v5/market/ticker")
            .match_query(Matcher::UrlEncoded("instId".into(), "BTC-USDT-SWAP".into()))
            .match_header("OK-ACCESS-KEY", "test-key")
            .match_header("OK-ACCESS-PASSPHRASE", "test-pass")
            .match_header("OK-ACCESS-SIGN", Matcher::Regex(r"^[A-Za-z0-9+/]+=*$".into()))
            .match_header("OK-ACCESS-TIMESTAMP", Matcher::Regex(r"^\d{4}-\d{2}-\d{2}T".into()))
            .with_status(200)
            .with_body(
                r#"{"code":"0","msg":"","data":[{"instId":"BTC-USDT-SWAP","last":"43250.1","ts":"1597026383085"}]}"#,
            )
            .create_async()
            .await;

        let ticker = client_for(&server).get_ticker("BTC-USDT-SWAP").await.unwrap();

        mock.assert_async().await;
        assert_eq!(ticker.symbol, "BTC-USDT-SWAP");
        assert_eq!(ticker.last, 43250.1);
    }

    #[tokio::test]
    async fn test_place_order_sends_compact_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v5/trade/order")
            .match_body(Matcher::PartialJson(json!({
                "instId": "ETH-USDT-SWAP",
                "side": "buy",
                "posSide": "long",
                "ordType": "limit",
                "sz": "2",
                "px": "1850.5",
                "tdMode": "cross"
            })))
            .with_status(200)
            .with_body(
                r#"{"code":"0","msg":"","data":[{"ordId":"12345","clOrdId":"abc","sCode":"0","sMsg":""}]}"#,
            )
            .create_async()
            .await;

        let request = OrderRequest::limit("ETH-USDT-SWAP", Side::Buy, 2.0, 1850.5)
            .with_pos_side(PositionSide::Long);
        let ack = client_for(&server).place_order(&request).await.unwrap();

        mock.assert_async().await;
        assert_eq!(ack.order_id, "12345");
        assert_eq!(ack.client_order_id.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_place_order_item_rejection_maps_code() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v5/trade/order")
            .with_status(200)
            .with_body(
                r#"{"code":"1","msg":"Operation failed.","data":[{"ordId":"","sCode":"51008","sMsg":"Insufficient balance"}]}"#,
            )
            .create_async()
            .await;

        let request = OrderRequest::market("ETH-USDT-SWAP", Side::Buy, 1.0);
        let result = client_for(&server).place_order(&request).await;

        assert!(matches!(result, Err(BotError::InsufficientBalance(_))));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v5/trade/order")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("Service Unavailable")
            .create_async()
            .await;

        let result = client_for(&server).get_order("BTC-USDT-SWAP", "1").await;
        assert!(matches!(result, Err(BotError::TransientNetwork(_))));
    }

    #[tokio::test]
    async fn test_get_order_parses_report() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v5/trade/order")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("instId".into(), "BTC-USDT-SWAP".into()),
                Matcher::UrlEncoded("ordId".into(), "777".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"code":"0","msg":"","data":[{"instId":"BTC-USDT-SWAP","ordId":"777","side":"sell",
                    "posSide":"short","ordType":"market","sz":"1","state":"filled","accFillSz":"1",
                    "avgPx":"42000","fee":"-0.5","uTime":"1597026383085"}]}"#,
            )
            .create_async()
            .await;

        let report = client_for(&server)
            .get_order("BTC-USDT-SWAP", "777")
            .await
            .unwrap();
        assert_eq!(report.status, Some(OrderStatus::Filled));
        assert_eq!(report.filled_amount, 1.0);
        assert_eq!(report.fee, 0.5);
    }

    #[tokio::test]
    async fn test_batch_cancel_partial_success() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v5/trade/cancel-batch-orders")
            .with_status(200)
            .with_body(
                r#"{"code":"2","msg":"","data":[
                    {"ordId":"1","sCode":"0","sMsg":""},
                    {"ordId":"2","sCode":"51400","sMsg":"Cancellation failed"}]}"#,
            )
            .create_async()
            .await;

        let orders = vec![
            ("BTC-USDT-SWAP".to_string(), "1".to_string()),
            ("BTC-USDT-SWAP".to_string(), "2".to_string()),
        ];
        let canceled = client_for(&server).cancel_orders(&orders).await.unwrap();
        assert_eq!(canceled, vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn test_batch_cancel_keeps_earlier_chunks_on_transport_error() {
        let mut server = mockito::Server::new_async().await;
        let ids: Vec<String> = (1..=21).map(|i| format!("o{:02}", i)).collect();
        let acks: Vec<String> = ids[..20]
            .iter()
            .map(|id| format!(r#"{{"ordId":"{}","sCode":"0","sMsg":""}}"#, id))
            .collect();

        server
            .mock("POST", "/api/v5/trade/cancel-batch-orders")
            .match_body(Matcher::Regex(r#""ordId":"o01""#.to_string()))
            .with_status(200)
            .with_body(format!(r#"{{"code":"0","msg":"","data":[{}]}}"#, acks.join(",")))
            .create_async()
            .await;
        server
            .mock("POST", "/api/v5/trade/cancel-batch-orders")
            .match_body(Matcher::Regex(r#""ordId":"o21""#.to_string()))
            .with_status(503)
            .with_body("Service Unavailable")
            .create_async()
            .await;

        let orders: Vec<(String, String)> = ids
            .iter()
            .map(|id| ("BTC-USDT-SWAP".to_string(), id.clone()))
            .collect();
        let canceled = tokio_test::assert_ok!(client_for(&server).cancel_orders(&orders).await);
        assert_eq!(canceled.len(), 20);
        assert!(!canceled.contains(&"o21".to_string()));
    }

    #[tokio::test]
    async fn test_batch_cancel_all_chunks_failed_is_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v5/trade/cancel-batch-orders")
            .with_status(503)
            .create_async()
            .await;

        let orders = vec![("BTC-USDT-SWAP".to_string(), "1".to_string())];
        tokio_test::assert_err!(client_for(&server).cancel_orders(&orders).await);
    }

    #[tokio::test]
    async fn test_positions_skip_malformed_records() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v5/account/positions")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"code":"0","msg":"","data":[
                    {"instId":"BTC-USDT-SWAP","posSide":"long","pos":"2","avgPx":"100"},
                    {"instId":"ETH-USDT-SWAP","posSide":"long","pos":"garbage","avgPx":"100"}]}"#,
            )
            .create_async()
            .await;

        let positions = client_for(&server).get_positions(None).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "BTC-USDT-SWAP");
        assert_eq!(positions[0].size, 2.0);
    }

    #[tokio::test]
    async fn test_candles_returned_oldest_first() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v5/market/candles")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"code":"0","msg":"","data":[
                    ["1597026443085","11","12","10","11.5","100","0","0","1"],
                    ["1597026383085","10","11","9","11","90","0","0","1"]]}"#,
            )
            .create_async()
            .await;

        let candles = client_for(&server)
            .get_candles("BTC-USDT-SWAP", "1m", 2)
            .await
            .unwrap();
        assert_eq!(candles.len(), 2);
        assert!(candles[0].timestamp < candles[1].timestamp);
        assert_eq!(candles[1].close, 11.5);
    }

    #[test]
    fn test_order_body_reduce_only_market() {
        let client = OkxRestClient::new(test_credentials());
        let request = OrderRequest::market("BTC-USDT-SWAP", Side::Sell, 0.5).reduce_only();
        let body = client.order_body(&request);

        assert_eq!(body["ordType"], "market");
        assert_eq!(body["sz"], "0.5");
        assert_eq!(body["reduceOnly"], true);
        assert!(body.get("px").is_none());
        assert!(body.get("posSide").is_none());
    }
}
