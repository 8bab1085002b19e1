use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use crate::api::ExchangeClient;
use crate::error::BotError;
use crate::models::{OrderAck, OrderReport, OrderRequest, OrderStatus, OrderType, PositionSide, Side};
use crate::persistence::{InstrumentCache, TradeRecorder};
use crate::Result;

/// How many finalized order ids to remember for ignoring late duplicates
const FINISHED_MEMORY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub pos_side: Option<PositionSide>,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: Option<f64>,
    pub status: OrderStatus,
    pub filled_amount: f64,
    pub remaining_amount: f64,
    pub avg_price: Option<f64>,
    pub fee: f64,
    pub trade_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ordering used to refuse status regressions (live after partially filled, etc.)
fn status_rank(status: OrderStatus) -> u8 {
    match status {
        OrderStatus::Pending => 0,
        OrderStatus::Open => 1,
        OrderStatus::PartiallyFilled => 2,
        _ => 3,
    }
}

/// Status used when the exchange did not report one
fn default_status(order_type: OrderType) -> OrderStatus {
    match order_type {
        OrderType::Market => OrderStatus::Filled,
        _ => OrderStatus::Open,
    }
}

impl Order {
    /// Build from a fresh exchange report
    pub fn from_report(report: &OrderReport) -> Self {
        let status = report.status.unwrap_or_else(|| default_status(report.order_type));
        let mut filled = report.filled_amount.max(0.0);
        if report.status.is_none() && status == OrderStatus::Filled && filled == 0.0 {
            // Market orders without a status are assumed done in full
            filled = report.amount;
        }

        Self {
            order_id: report.order_id.clone(),
            client_order_id: report.client_order_id.clone(),
            symbol: report.symbol.clone(),
            side: report.side,
            pos_side: report.pos_side,
            order_type: report.order_type,
            amount: report.amount,
            price: report.price,
            status,
            filled_amount: filled,
            remaining_amount: (report.amount - filled).max(0.0),
            avg_price: report.avg_price,
            fee: report.fee,
            trade_ids: report.trade_id.iter().cloned().collect(),
            created_at: report.updated_at,
            updated_at: report.updated_at,
        }
    }

    /// Build from an accepted submission when no report is available yet
    pub fn from_submission(request: &OrderRequest, ack: &OrderAck) -> Self {
        let now = Utc::now();
        Self::from_report(&OrderReport {
            order_id: ack.order_id.clone(),
            client_order_id: ack.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            pos_side: request.pos_side,
            order_type: request.order_type,
            amount: request.amount,
            price: request.price,
            status: None,
            filled_amount: 0.0,
            avg_price: None,
            fee: 0.0,
            trade_id: None,
            updated_at: now,
        })
    }

    /// Merge an exchange report into this order.
    ///
    /// Filled amount never decreases and a final status is never left.
    pub fn update_from_exchange(&mut self, report: &OrderReport) {
        if report.order_id != self.order_id {
            tracing::warn!(
                order_id = %self.order_id,
                reported = %report.order_id,
                "Ignoring report for a different order"
            );
            return;
        }

        let progressed = report.filled_amount >= self.filled_amount;
        if progressed {
            self.filled_amount = report.filled_amount;
            if report.avg_price.is_some() {
                self.avg_price = report.avg_price;
            }
            // Exchange fees are cumulative per order
            self.fee = report.fee;
        }
        self.remaining_amount = (self.amount - self.filled_amount).max(0.0);

        if let Some(status) = report.status {
            if !self.status.is_final() && status_rank(status) >= status_rank(self.status) {
                self.status = status;
            }
        }

        if let Some(ref trade_id) = report.trade_id {
            if !self.trade_ids.contains(trade_id) {
                self.trade_ids.push(trade_id.clone());
            }
        }

        if report.updated_at > self.updated_at {
            self.updated_at = report.updated_at;
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }
}

/// Outcome of a cancel-all request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CancelSummary {
    pub canceled: Vec<String>,
    pub failed: Vec<String>,
}

impl CancelSummary {
    pub fn all_canceled(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Tracks one user's active orders from submission to a final state.
///
/// Records are replaced whole on every update so readers never observe a
/// half-applied report.
pub struct OrderManager {
    user: String,
    client: Arc<dyn ExchangeClient>,
    instruments: Option<Arc<InstrumentCache>>,
    recorder: Arc<dyn TradeRecorder>,
    active: RwLock<HashMap<String, Arc<Order>>>,
    finished: RwLock<(HashSet<String>, VecDeque<String>)>,
    max_age: Duration,
}

impl OrderManager {
    pub fn new(
        user: impl Into<String>,
        client: Arc<dyn ExchangeClient>,
        recorder: Arc<dyn TradeRecorder>,
        max_age: Duration,
    ) -> Self {
        Self {
            user: user.into(),
            client,
            instruments: None,
            recorder,
            active: RwLock::new(HashMap::new()),
            finished: RwLock::new((HashSet::new(), VecDeque::new())),
            max_age,
        }
    }

    /// Round sizes to the instrument lot grid before submission
    pub fn with_instruments(mut self, instruments: Arc<InstrumentCache>) -> Self {
        self.instruments = Some(instruments);
        self
    }

    pub fn client(&self) -> &Arc<dyn ExchangeClient> {
        &self.client
    }

    pub fn get(&self, order_id: &str) -> Option<Arc<Order>> {
        self.read_active().get(order_id).cloned()
    }

    pub fn active_orders(&self, symbol: Option<&str>) -> Vec<Arc<Order>> {
        self.read_active()
            .values()
            .filter(|o| symbol.map(|s| o.symbol == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.read_active().len()
    }

    /// Validate, submit and start tracking a new order.
    pub async fn create_order(&self, mut request: OrderRequest) -> Result<Arc<Order>> {
        if !(request.amount.is_finite() && request.amount > 0.0) {
            return Err(BotError::InvalidOrder(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }
        if request.order_type.requires_price() {
            match request.price {
                Some(price) if price.is_finite() && price > 0.0 => {}
                _ => {
                    return Err(BotError::InvalidOrder(format!(
                        "{} order requires a price",
                        request.order_type.as_str()
                    )))
                }
            }
        }

        if let Some(ref instruments) = self.instruments {
            let info = instruments.get(&request.symbol).await?;
            let rounded = info.round_size(request.amount);
            if rounded < info.min_size || rounded <= 0.0 {
                return Err(BotError::InvalidOrder(format!(
                    "size {} below minimum {} for {}",
                    request.amount, info.min_size, request.symbol
                )));
            }
            request.amount = rounded;
            request.price = request.price.map(|p| info.round_price(p));
        }

        if request.client_order_id.is_none() {
            request.client_order_id = Some(uuid::Uuid::new_v4().simple().to_string());
        }

        let ack = self.client.place_order(&request).await?;

        // Market orders settle at once; ask for the real fill instead of assuming it
        let order = match request.order_type {
            OrderType::Market => match self.client.get_order(&request.symbol, &ack.order_id).await {
                Ok(report) => {
                    let mut order = Order::from_report(&report);
                    if order.client_order_id.is_none() {
                        order.client_order_id = ack.client_order_id.clone();
                    }
                    order
                }
                Err(e) => {
                    tracing::debug!(order_id = %ack.order_id, "Fill lookup failed: {}", e);
                    Order::from_submission(&request, &ack)
                }
            },
            _ => Order::from_submission(&request, &ack),
        };

        let order = Arc::new(order);
        if order.is_active() {
            self.write_active()
                .insert(order.order_id.clone(), order.clone());
        } else {
            self.finalize(&order);
        }
        Ok(order)
    }

    /// Merge an exchange report. Returns the updated record, or None for a
    /// late report about an order that was already finalized.
    pub fn update_from_exchange(&self, report: &OrderReport) -> Option<Arc<Order>> {
        if self.is_finished(&report.order_id) {
            tracing::debug!(order_id = %report.order_id, "Ignoring report for finalized order");
            return None;
        }

        let merged = {
            let mut active = self.write_active();
            let merged = match active.get(&report.order_id) {
                Some(existing) => {
                    let mut next = Order::clone(existing);
                    next.update_from_exchange(report);
                    next
                }
                None => Order::from_report(report),
            };
            let merged = Arc::new(merged);
            if merged.is_active() {
                active.insert(merged.order_id.clone(), merged.clone());
            } else {
                active.remove(&merged.order_id);
            }
            merged
        };

        if merged.is_final() {
            self.finalize(&merged);
        }
        Some(merged)
    }

    /// Request cancellation.
    ///
    /// Returns false for untracked or already-final orders, and when the
    /// exchange refuses; a refused order stays tracked for the next poll.
    pub async fn cancel_order(&self, order_id: &str) -> bool {
        let order = match self.get(order_id) {
            Some(order) if order.is_active() => order,
            _ => return false,
        };

        match self.client.cancel_order(&order.symbol, order_id).await {
            Ok(()) => {
                self.mark_canceled(&order);
                true
            }
            Err(e) => {
                tracing::warn!(
                    order_id = %order_id,
                    symbol = %order.symbol,
                    "Cancel failed, keeping order tracked: {}",
                    e
                );
                false
            }
        }
    }

    /// Cancel every active order, optionally for one symbol.
    ///
    /// Tries one bulk call first and falls back to one call per order.
    pub async fn cancel_all_orders(&self, symbol: Option<&str>) -> CancelSummary {
        let targets = self.active_orders(symbol);
        let mut summary = CancelSummary::default();
        if targets.is_empty() {
            return summary;
        }

        let pairs: Vec<(String, String)> = targets
            .iter()
            .map(|o| (o.symbol.clone(), o.order_id.clone()))
            .collect();

        match self.client.cancel_orders(&pairs).await {
            Ok(canceled) => {
                for order in &targets {
                    if canceled.contains(&order.order_id) {
                        self.mark_canceled(order);
                        summary.canceled.push(order.order_id.clone());
                    } else {
                        summary.failed.push(order.order_id.clone());
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Bulk cancel failed ({}), cancelling one by one", e);
                for order in &targets {
                    if self.cancel_order(&order.order_id).await {
                        summary.canceled.push(order.order_id.clone());
                    } else {
                        summary.failed.push(order.order_id.clone());
                    }
                }
            }
        }

        tracing::info!(
            canceled = summary.canceled.len(),
            failed = summary.failed.len(),
            "Cancel-all finished"
        );
        summary
    }

    /// Poll the exchange for an order's status and merge it
    pub async fn refresh_order(&self, order_id: &str) -> Result<Option<Arc<Order>>> {
        let symbol = match self.get(order_id) {
            Some(order) => order.symbol.clone(),
            None => return Err(BotError::NotFound(format!("order {} not tracked", order_id))),
        };
        let report = self.client.get_order(&symbol, order_id).await?;
        Ok(self.update_from_exchange(&report))
    }

    /// Poll every active order that has gone quiet for at least `min_age`.
    ///
    /// Covers pushes lost while a feed was down and cancels the exchange
    /// refused. Returns how many orders reached a final state.
    pub async fn poll_active(&self, now: DateTime<Utc>, min_age: Duration) -> usize {
        let quiet: Vec<String> = self
            .read_active()
            .values()
            .filter(|o| now - o.updated_at >= min_age)
            .map(|o| o.order_id.clone())
            .collect();

        let mut finalized = 0;
        for order_id in quiet {
            match self.refresh_order(&order_id).await {
                Ok(Some(order)) if order.is_final() => finalized += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(user = %self.user, order_id = %order_id, "Status poll failed: {}", e)
                }
            }
        }
        finalized
    }

    /// Rebuild the active set from the exchange's open orders.
    ///
    /// Unknown open orders are adopted; tracked ones missing from the list
    /// finished while we weren't listening and get their final state polled.
    pub async fn sync_open_orders(&self) -> Result<usize> {
        let open = self.client.get_pending_orders(None).await?;
        let open_ids: HashSet<String> = open.iter().map(|r| r.order_id.clone()).collect();
        for report in &open {
            self.update_from_exchange(report);
        }

        let missing: Vec<String> = self
            .read_active()
            .keys()
            .filter(|id| !open_ids.contains(*id))
            .cloned()
            .collect();
        for order_id in missing {
            if let Err(e) = self.refresh_order(&order_id).await {
                tracing::warn!(user = %self.user, order_id = %order_id, "Final state lookup failed: {}", e);
            }
        }
        Ok(open.len())
    }

    /// Evict orders with no update for longer than the max age
    pub fn sweep_stale(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut active = self.write_active();
        let stale: Vec<String> = active
            .values()
            .filter(|o| now - o.updated_at > self.max_age)
            .map(|o| o.order_id.clone())
            .collect();

        for id in &stale {
            if let Some(order) = active.remove(id) {
                tracing::warn!(
                    user = %self.user,
                    order_id = %id,
                    symbol = %order.symbol,
                    last_update = %order.updated_at,
                    "Evicted stale order without a final update"
                );
            }
        }
        stale
    }

    fn mark_canceled(&self, order: &Order) {
        let mut canceled = order.clone();
        canceled.status = OrderStatus::Canceled;
        canceled.updated_at = Utc::now();
        self.write_active().remove(&order.order_id);
        self.finalize(&canceled);
    }

    fn finalize(&self, order: &Order) {
        self.recorder.record(&self.user, order);

        let mut finished = self.finished.write().unwrap_or_else(|e| e.into_inner());
        let (ids, queue) = &mut *finished;
        if ids.insert(order.order_id.clone()) {
            queue.push_back(order.order_id.clone());
            while queue.len() > FINISHED_MEMORY {
                if let Some(oldest) = queue.pop_front() {
                    ids.remove(&oldest);
                }
            }
        }
    }

    fn is_finished(&self, order_id: &str) -> bool {
        self.finished
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .0
            .contains(order_id)
    }

    fn read_active(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Order>>> {
        self.active.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_active(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Order>>> {
        self.active.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockExchange;
    use crate::persistence::LogRecorder;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingRecorder {
        orders: Mutex<Vec<Order>>,
    }

    impl TradeRecorder for CollectingRecorder {
        fn record(&self, _user: &str, order: &Order) {
            self.orders.lock().unwrap().push(order.clone());
        }
    }

    fn manager(exchange: Arc<MockExchange>) -> OrderManager {
        OrderManager::new("u1", exchange, Arc::new(LogRecorder), Duration::minutes(30))
    }

    fn report(id: &str, status: Option<OrderStatus>, filled: f64) -> OrderReport {
        OrderReport {
            order_id: id.to_string(),
            client_order_id: None,
            symbol: "BTC-USDT-SWAP".to_string(),
            side: Side::Buy,
            pos_side: Some(PositionSide::Long),
            order_type: OrderType::Limit,
            amount: 2.0,
            price: Some(100.0),
            status,
            filled_amount: filled,
            avg_price: Some(100.0),
            fee: 0.01 * filled,
            trade_id: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_then_cancel_removes_order() {
        let exchange = Arc::new(MockExchange::new());
        let om = manager(exchange);

        let order = om
            .create_order(OrderRequest::limit("BTC-USDT-SWAP", Side::Buy, 1.0, 95.0))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Open);
        assert!(order.client_order_id.is_some());
        assert_eq!(om.active_count(), 1);

        assert!(om.cancel_order(&order.order_id).await);
        assert_eq!(om.active_count(), 0);
        assert!(om.get(&order.order_id).is_none());
    }

    #[tokio::test]
    async fn test_cancel_terminal_order_returns_false() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("BTC-USDT-SWAP", 100.0);
        let om = manager(exchange);

        let order = om
            .create_order(OrderRequest::market("BTC-USDT-SWAP", Side::Buy, 1.0))
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_price, Some(100.0));
        assert!(!om.cancel_order(&order.order_id).await);
    }

    #[tokio::test]
    async fn test_failed_cancel_keeps_order_tracked() {
        let exchange = Arc::new(MockExchange::new());
        let om = manager(exchange.clone());
        let order = om
            .create_order(OrderRequest::limit("BTC-USDT-SWAP", Side::Buy, 1.0, 95.0))
            .await
            .unwrap();

        exchange.fail_cancels(true);
        assert!(!om.cancel_order(&order.order_id).await);
        assert!(om.get(&order.order_id).is_some());
    }

    #[tokio::test]
    async fn test_rejects_invalid_requests() {
        let om = manager(Arc::new(MockExchange::new()));

        let zero = om
            .create_order(OrderRequest::market("BTC-USDT-SWAP", Side::Buy, 0.0))
            .await;
        assert!(matches!(zero, Err(BotError::InvalidOrder(_))));

        let mut no_price = OrderRequest::limit("BTC-USDT-SWAP", Side::Buy, 1.0, 1.0);
        no_price.price = None;
        assert!(matches!(
            om.create_order(no_price).await,
            Err(BotError::InvalidOrder(_))
        ));
        assert_eq!(om.active_count(), 0);
    }

    #[tokio::test]
    async fn test_rejection_surfaces_to_caller() {
        let exchange = Arc::new(MockExchange::new());
        exchange.reject_next_place("51008", "Insufficient balance");
        let om = manager(exchange);

        let result = om
            .create_order(OrderRequest::limit("BTC-USDT-SWAP", Side::Buy, 1.0, 95.0))
            .await;
        assert!(matches!(result, Err(BotError::InsufficientBalance(_))));
        assert_eq!(om.active_count(), 0);
    }

    #[test]
    fn test_filled_amount_is_monotonic() {
        let mut order = Order::from_report(&report("1", Some(OrderStatus::Open), 0.0));

        for (filled, expected) in [(0.5, 0.5), (1.5, 1.5), (1.0, 1.5), (2.0, 2.0)] {
            order.update_from_exchange(&report("1", Some(OrderStatus::PartiallyFilled), filled));
            assert_eq!(order.filled_amount, expected);
            assert_eq!(order.remaining_amount, (order.amount - order.filled_amount).max(0.0));
        }
    }

    #[test]
    fn test_remaining_never_negative() {
        let mut order = Order::from_report(&report("1", Some(OrderStatus::Open), 0.0));
        order.update_from_exchange(&report("1", Some(OrderStatus::Filled), 2.5));
        assert_eq!(order.remaining_amount, 0.0);
    }

    #[test]
    fn test_final_status_is_sticky() {
        let mut order = Order::from_report(&report("1", Some(OrderStatus::Open), 0.0));
        order.update_from_exchange(&report("1", Some(OrderStatus::Canceled), 0.0));
        order.update_from_exchange(&report("1", Some(OrderStatus::Open), 0.0));
        assert_eq!(order.status, OrderStatus::Canceled);

        let mut partial = Order::from_report(&report("2", Some(OrderStatus::PartiallyFilled), 1.0));
        partial.update_from_exchange(&report("2", Some(OrderStatus::Open), 1.0));
        assert_eq!(partial.status, OrderStatus::PartiallyFilled);
    }

    #[test]
    fn test_missing_status_defaults_by_type() {
        let mut market = report("1", None, 0.0);
        market.order_type = OrderType::Market;
        let order = Order::from_report(&market);
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_amount, 2.0);

        let limit = Order::from_report(&report("2", None, 0.0));
        assert_eq!(limit.status, OrderStatus::Open);
    }

    #[test]
    fn test_stream_fill_finalizes_and_records() {
        let recorder = Arc::new(CollectingRecorder::default());
        let om = OrderManager::new(
            "u1",
            Arc::new(MockExchange::new()),
            recorder.clone(),
            Duration::minutes(30),
        );

        om.update_from_exchange(&report("9", Some(OrderStatus::Open), 0.0));
        assert_eq!(om.active_count(), 1);

        let done = om
            .update_from_exchange(&report("9", Some(OrderStatus::Filled), 2.0))
            .unwrap();
        assert_eq!(done.status, OrderStatus::Filled);
        assert_eq!(om.active_count(), 0);
        assert_eq!(recorder.orders.lock().unwrap().len(), 1);

        // Late duplicate is ignored, not recorded twice
        assert!(om
            .update_from_exchange(&report("9", Some(OrderStatus::Filled), 2.0))
            .is_none());
        assert_eq!(recorder.orders.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_all_falls_back_per_order() {
        let exchange = Arc::new(MockExchange::new());
        let om = manager(exchange.clone());
        for price in [90.0, 91.0, 92.0] {
            om.create_order(OrderRequest::limit("BTC-USDT-SWAP", Side::Buy, 1.0, price))
                .await
                .unwrap();
        }
        om.create_order(OrderRequest::limit("ETH-USDT-SWAP", Side::Buy, 1.0, 10.0))
            .await
            .unwrap();

        exchange.fail_bulk_cancels(true);
        let summary = om.cancel_all_orders(Some("BTC-USDT-SWAP")).await;

        assert_eq!(summary.canceled.len(), 3);
        assert!(summary.all_canceled());
        assert_eq!(om.active_orders(Some("ETH-USDT-SWAP")).len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_all_uses_bulk() {
        let exchange = Arc::new(MockExchange::new());
        let om = manager(exchange);
        om.create_order(OrderRequest::limit("BTC-USDT-SWAP", Side::Buy, 1.0, 90.0))
            .await
            .unwrap();
        om.create_order(OrderRequest::limit("BTC-USDT-SWAP", Side::Buy, 1.0, 91.0))
            .await
            .unwrap();

        let summary = om.cancel_all_orders(None).await;
        assert_eq!(summary.canceled.len(), 2);
        assert_eq!(om.active_count(), 0);
    }

    #[test]
    fn test_sweep_evicts_stale_orders() {
        let om = manager(Arc::new(MockExchange::new()));
        let mut old = report("old", Some(OrderStatus::Open), 0.0);
        old.updated_at = Utc::now() - Duration::hours(2);
        om.update_from_exchange(&old);
        om.update_from_exchange(&report("fresh", Some(OrderStatus::Open), 0.0));

        let evicted = om.sweep_stale(Utc::now());
        assert_eq!(evicted, vec!["old".to_string()]);
        assert!(om.get("fresh").is_some());
    }

    #[tokio::test]
    async fn test_poll_resolves_refused_cancel() {
        let exchange = Arc::new(MockExchange::new());
        let recorder = Arc::new(CollectingRecorder::default());
        let om = OrderManager::new(
            "u1",
            exchange.clone(),
            recorder.clone(),
            Duration::hours(1),
        );
        let order = om
            .create_order(OrderRequest::limit("BTC-USDT-SWAP", Side::Buy, 1.0, 95.0))
            .await
            .unwrap();

        exchange.fail_cancels(true);
        assert!(!om.cancel_order(&order.order_id).await);
        exchange.fill(&order.order_id, 1.0, 95.0);

        // Too recent to poll
        assert_eq!(om.poll_active(Utc::now() - Duration::minutes(1), Duration::seconds(30)).await, 0);
        assert_eq!(om.active_count(), 1);

        assert_eq!(om.poll_active(Utc::now(), Duration::zero()).await, 1);
        assert_eq!(om.active_count(), 0);
        let recorded = recorder.orders.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_sync_open_orders_adopts_and_finalizes() {
        let exchange = Arc::new(MockExchange::new());
        let om = manager(exchange.clone());
        let tracked = om
            .create_order(OrderRequest::limit("BTC-USDT-SWAP", Side::Buy, 1.0, 95.0))
            .await
            .unwrap();

        // Placed by another session, and a fill we never heard about
        let other = OrderManager::new(
            "u1",
            exchange.clone(),
            Arc::new(LogRecorder),
            Duration::hours(1),
        );
        let foreign = other
            .create_order(OrderRequest::limit("ETH-USDT-SWAP", Side::Sell, 2.0, 2000.0))
            .await
            .unwrap();
        exchange.fill(&tracked.order_id, 1.0, 95.0);

        let open = tokio_test::assert_ok!(om.sync_open_orders().await);
        assert_eq!(open, 1);
        assert!(om.get(&tracked.order_id).is_none());
        assert!(om.get(&foreign.order_id).is_some());
    }

    #[tokio::test]
    async fn test_refresh_order_merges_fill() {
        let exchange = Arc::new(MockExchange::new());
        let om = manager(exchange.clone());
        let order = om
            .create_order(OrderRequest::limit("BTC-USDT-SWAP", Side::Buy, 1.0, 95.0))
            .await
            .unwrap();

        exchange.fill(&order.order_id, 1.0, 95.0);
        let refreshed = om.refresh_order(&order.order_id).await.unwrap().unwrap();

        assert_eq!(refreshed.status, OrderStatus::Filled);
        assert_eq!(om.active_count(), 0);
    }
}
