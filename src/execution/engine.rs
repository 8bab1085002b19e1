//! One user's trading loop: feed events and signals in, orders out.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::controller::{ControllerSettings, OrderIntent, SymbolController};
use super::orders::OrderManager;
use super::positions::PositionBook;
use crate::error::BotError;
use crate::models::{OrderStatus, PositionSide, PositionSnapshot};
use crate::notify::Notifier;
use crate::stream::FeedEvent;
use crate::strategy::SignalUpdate;
use crate::Result;

pub struct TradingEngine {
    user: String,
    exchange: String,
    orders: Arc<OrderManager>,
    settings: Arc<ControllerSettings>,
    controllers: HashMap<String, SymbolController>,
    positions: Arc<PositionBook>,
    notifier: Arc<dyn Notifier>,
    order_poll_age: chrono::Duration,
}

impl TradingEngine {
    pub fn new(
        user: &str,
        orders: Arc<OrderManager>,
        settings: Arc<ControllerSettings>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let exchange = orders.client().exchange().to_string();
        Self {
            user: user.to_string(),
            exchange,
            orders,
            settings,
            controllers: HashMap::new(),
            positions: Arc::new(PositionBook::new()),
            notifier,
            order_poll_age: chrono::Duration::seconds(30),
        }
    }

    /// Poll active orders that have had no update for this long
    pub fn with_order_poll_age(mut self, age: chrono::Duration) -> Self {
        self.order_poll_age = age;
        self
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Read-only view of this user's open positions
    pub fn positions(&self) -> Arc<PositionBook> {
        self.positions.clone()
    }

    pub fn orders(&self) -> &Arc<OrderManager> {
        &self.orders
    }

    pub fn controller(&self, symbol: &str) -> Option<&SymbolController> {
        self.controllers.get(symbol)
    }

    fn controller_mut(&mut self, symbol: &str) -> &mut SymbolController {
        let (user, exchange, settings) = (&self.user, &self.exchange, &self.settings);
        self.controllers
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolController::new(user, exchange, symbol, settings.clone()))
    }

    /// Consume events until the feed channel closes.
    ///
    /// # Arguments
    /// * `feed` - Order, position and price events from the streaming feeds
    /// * `signals` - Upstream indicator updates
    /// * `sweep_every` - Period of the order status poll and stale-order sweep
    pub async fn run(
        mut self,
        mut feed: mpsc::Receiver<FeedEvent>,
        mut signals: mpsc::Receiver<SignalUpdate>,
        sweep_every: Duration,
    ) {
        tracing::info!(user = %self.user, exchange = %self.exchange, "🚀 Trading engine started");
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.tick().await;

        loop {
            tokio::select! {
                event = feed.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        tracing::info!(user = %self.user, "Feed channel closed, engine stopping");
                        break;
                    }
                },
                Some(signal) = signals.recv() => self.handle_signal(signal).await,
                _ = sweep.tick() => {
                    self.poll_orders().await;
                    let evicted = self.orders.sweep_stale(Utc::now());
                    if !evicted.is_empty() {
                        tracing::warn!(user = %self.user, count = evicted.len(), "Swept stale orders");
                    }
                }
            }
        }

        tracing::info!(user = %self.user, "🛑 Trading engine stopped");
    }

    pub async fn handle_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Order(report) => {
                if let Some(order) = self.orders.update_from_exchange(&report) {
                    if order.status == OrderStatus::Rejected {
                        self.notifier.notify(
                            &self.user,
                            &format!("Order {} on {} rejected", order.order_id, order.symbol),
                        );
                    }
                }
            }
            FeedEvent::Position(snapshot) => {
                let symbol = snapshot.symbol.clone();
                let intents = self
                    .controller_mut(&symbol)
                    .on_position_snapshot(&snapshot, Utc::now());
                self.publish(&symbol, snapshot.side);
                self.execute(&symbol, intents).await;
            }
            FeedEvent::Price(ticker) => {
                // Prices only matter for symbols with a position
                let intents = match self.controllers.get_mut(&ticker.symbol) {
                    Some(controller) => controller.on_price(ticker.last, Utc::now()),
                    None => return,
                };
                self.execute(&ticker.symbol, intents).await;
            }
            FeedEvent::Connected { feed } => {
                tracing::info!(user = %self.user, feed = %feed, "🔗 Feed connected, resyncing state");
                Box::pin(self.resync()).await;
            }
        }
    }

    /// Catch up on anything pushed while the private feed was down
    pub async fn resync(&mut self) {
        if let Err(e) = self.sync_positions().await {
            tracing::warn!(user = %self.user, "Position resync failed: {}", e);
        }
        match self.orders.sync_open_orders().await {
            Ok(open) => tracing::debug!(user = %self.user, open, "Open orders resynced"),
            Err(e) => tracing::warn!(user = %self.user, "Order resync failed: {}", e),
        }
    }

    /// Status poll for orders the stream has gone quiet on
    pub async fn poll_orders(&self) -> usize {
        let finalized = self
            .orders
            .poll_active(Utc::now(), self.order_poll_age)
            .await;
        if finalized > 0 {
            tracing::info!(user = %self.user, finalized, "Order poll resolved orders");
        }
        finalized
    }

    pub async fn handle_signal(&mut self, signal: SignalUpdate) {
        let symbol = signal.symbol.clone();
        let intents = match self.controllers.get_mut(&symbol) {
            Some(controller) => controller.on_signal(signal),
            None => return,
        };
        self.execute(&symbol, intents).await;
    }

    /// Load current positions over REST, as at startup or after a reconnect.
    /// Tracked positions the exchange no longer reports are closed.
    pub async fn sync_positions(&mut self) -> Result<usize> {
        let snapshots = self.orders.client().get_positions(None).await?;
        let count = snapshots.len();
        let reported: HashSet<(String, PositionSide)> = snapshots
            .iter()
            .filter(|s| s.size > 0.0)
            .map(|s| (s.symbol.clone(), s.side))
            .collect();

        let now = Utc::now();
        let closed: Vec<PositionSnapshot> = self
            .controllers
            .values()
            .flat_map(|c| c.main().into_iter().chain(c.hedge()))
            .filter(|p| !reported.contains(&(p.symbol.clone(), p.side)))
            .map(|p| PositionSnapshot {
                symbol: p.symbol.clone(),
                side: p.side,
                size: 0.0,
                entry_price: p.entry_price,
                leverage: p.leverage,
                unrealized_pnl: 0.0,
                realized_pnl: p.realized_pnl,
                mark_price: None,
                updated_at: now,
            })
            .collect();

        for snapshot in closed.into_iter().chain(snapshots) {
            self.handle_event(FeedEvent::Position(snapshot)).await;
        }
        tracing::info!(user = %self.user, "🔄 Synced {} positions from exchange", count);
        Ok(count)
    }

    fn publish(&self, symbol: &str, side: PositionSide) {
        let controller = match self.controllers.get(symbol) {
            Some(controller) => controller,
            None => return,
        };
        let position = controller
            .main()
            .filter(|p| p.side == side)
            .or_else(|| controller.hedge().filter(|p| p.side == side));
        match position {
            Some(position) => self.positions.publish(position),
            None => self.positions.remove(symbol, side),
        }
    }

    async fn execute(&mut self, symbol: &str, intents: Vec<OrderIntent>) {
        let orders = self.orders.clone();
        for intent in intents {
            let result = orders.create_order(intent.to_request()).await;
            let now = Utc::now();
            let controller = match self.controllers.get_mut(symbol) {
                Some(controller) => controller,
                None => return,
            };

            match result {
                Ok(order) => {
                    let quantity = if order.filled_amount > 0.0 {
                        order.filled_amount
                    } else {
                        intent.quantity
                    };
                    let price = order
                        .avg_price
                        .or(controller.last_price())
                        .unwrap_or_default();
                    tracing::info!(
                        user = %self.user,
                        symbol = %symbol,
                        order_id = %order.order_id,
                        kind = ?intent.kind,
                        "✅ {:?} {} {} @ ${:.4}",
                        intent.side,
                        intent.pos_side,
                        quantity,
                        price
                    );
                    controller.record_fill(&intent, quantity, price, now);
                }
                Err(e) => {
                    controller.record_failure(&intent, &e, now);
                    self.report_failure(symbol, &intent, &e);
                }
            }
        }
    }

    fn report_failure(&self, symbol: &str, intent: &OrderIntent, error: &BotError) {
        tracing::error!(
            user = %self.user,
            symbol = %symbol,
            kind = ?intent.kind,
            "❌ Order failed: {}",
            error
        );
        if error.blocks_entries() {
            self.notifier.notify(
                &self.user,
                &format!("New entries on {} paused: {}", symbol, error),
            );
        } else if matches!(error, BotError::OrderRejected { .. }) {
            self.notifier
                .notify(&self.user, &format!("Order on {} rejected: {}", symbol, error));
        }
    }
}
