use async_trait::async_trait;
use perpbot::api::{ExchangeClient, MockExchange};
use perpbot::execution::{ControllerSettings, OrderManager, TradingEngine};
use perpbot::notify::MemoryNotifier;
use perpbot::persistence::{activate_symbol, running_users, LogRecorder, MemoryStore};
use perpbot::stream::{ReconnectPolicy, WsConnection, WsConnector};
use perpbot::sync::{FeedSupervisor, FeedTemplate, ReconciliationLoop};
use perpbot::{BotError, Credentials, PositionSide, Result, Side};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, unbounded_channel, UnboundedReceiver, UnboundedSender};

const SYMBOL: &str = "BTC-USDT-SWAP";

// ============================================================================
// Channel-backed socket
// ============================================================================

struct Server {
    sent: UnboundedReceiver<String>,
    push: UnboundedSender<String>,
}

impl Server {
    async fn next_sent(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(2), self.sent.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client socket dropped")
    }

    fn reply(&self, text: &str) {
        let _ = self.push.send(text.to_string());
    }
}

struct Connection {
    sent: UnboundedSender<String>,
    incoming: UnboundedReceiver<String>,
}

#[async_trait]
impl WsConnection for Connection {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sent.send(text).map_err(|_| BotError::ConnectionClosed)
    }

    async fn next_text(&mut self) -> Result<Option<String>> {
        Ok(self.incoming.recv().await)
    }

    async fn close(&mut self) {}
}

#[derive(Default)]
struct Connector {
    pending: Mutex<VecDeque<Connection>>,
}

impl Connector {
    fn prepare(&self) -> Server {
        let (sent_tx, sent_rx) = unbounded_channel();
        let (push_tx, push_rx) = unbounded_channel();
        self.pending.lock().unwrap().push_back(Connection {
            sent: sent_tx,
            incoming: push_rx,
        });
        Server {
            sent: sent_rx,
            push: push_tx,
        }
    }
}

#[async_trait]
impl WsConnector for Connector {
    async fn connect(&self, url: &str) -> Result<Box<dyn WsConnection>> {
        match self.pending.lock().unwrap().pop_front() {
            Some(conn) => Ok(Box::new(conn)),
            None => Err(BotError::TransientNetwork(format!("no server at {}", url))),
        }
    }
}

fn template() -> FeedTemplate {
    FeedTemplate {
        private_url: "wss://test/ws/v5/private".to_string(),
        public_url: None,
        inst_type: "SWAP".to_string(),
        ping_interval: Duration::from_secs(3600),
        login_timeout: Duration::from_secs(1),
        reconnect: ReconnectPolicy::new(
            Duration::from_millis(5),
            Duration::from_millis(20),
            2.0,
            0.0,
            3,
        ),
        resync_interval: None,
    }
}

fn credentials() -> Credentials {
    Credentials {
        api_key: "key".to_string(),
        secret: "secret".to_string(),
        passphrase: "pass".to_string(),
    }
}

#[tokio::test]
async fn test_feed_to_engine_to_orders() {
    let _ = tracing_subscriber::fmt::try_init();

    println!("=== Starting Sync Flow Test ===\n");

    // 1. Shared store says u1 trades BTC
    let store = Arc::new(MemoryStore::new());
    activate_symbol(store.as_ref(), "mock", "u1", SYMBOL).await.unwrap();

    // 2. Engine on the mock exchange
    let exchange = Arc::new(MockExchange::new());
    exchange.set_price(SYMBOL, 97.0);
    let client: Arc<dyn ExchangeClient> = exchange.clone();
    let orders = Arc::new(OrderManager::new(
        "u1",
        client,
        Arc::new(LogRecorder),
        chrono::Duration::hours(1),
    ));
    let notifier = Arc::new(MemoryNotifier::new());
    let engine = TradingEngine::new(
        "u1",
        orders,
        Arc::new(ControllerSettings::default()),
        notifier.clone(),
    );
    let positions = engine.positions();

    let (feed_tx, feed_rx) = mpsc::channel(64);
    let (_signal_tx, signal_rx) = mpsc::channel(8);
    let engine_task = tokio::spawn(engine.run(feed_rx, signal_rx, Duration::from_secs(60)));

    // 3. Supervisor + reconciliation start the feed
    let connector = Arc::new(Connector::default());
    let mut server = connector.prepare();
    let supervisor = Arc::new(FeedSupervisor::new(
        "mock",
        store.clone(),
        connector.clone(),
        template(),
    ));
    supervisor.register("u1", credentials(), feed_tx);
    let reconciler =
        ReconciliationLoop::new(supervisor.clone(), store.clone(), "mock", Duration::from_secs(30));

    let login = tokio::spawn(async move {
        let frame = server.next_sent().await;
        assert!(frame.contains("\"op\":\"login\""));
        server.reply(r#"{"event":"login","code":"0","msg":""}"#);
        let subscribe = server.next_sent().await;
        (server, subscribe)
    });
    let report = reconciler.reconcile_once().await;
    assert_eq!(report.restarted, vec!["u1".to_string()]);
    let (server, subscribe) = login.await.unwrap();
    assert!(subscribe.contains(SYMBOL));
    assert!(running_users(store.as_ref(), "mock").await.unwrap().contains("u1"));
    println!("   ✓ Feed started and subscribed");

    // 4. Exchange reports a long at 100, marked at 97: below the 2% DCA trigger
    server.reply(&format!(
        r#"{{"arg":{{"channel":"positions","instType":"SWAP"}},"data":[{{"instId":"{}","posSide":"long","pos":"1","avgPx":"100","lever":"5","upl":"-3","realizedPnl":"0","markPx":"97","uTime":"1700000000000"}}]}}"#,
        SYMBOL
    ));

    let mut placed = Vec::new();
    for _ in 0..100 {
        placed = exchange.placed_orders();
        if !placed.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(placed.len(), 1, "DCA entry was not placed");
    assert_eq!(placed[0].symbol, SYMBOL);
    assert_eq!(placed[0].side, Side::Buy);
    assert_eq!(placed[0].pos_side, Some(PositionSide::Long));
    assert_eq!(placed[0].amount, 1.5);
    assert!(positions.get(SYMBOL, PositionSide::Long).is_some());
    println!("   ✓ DCA entry placed: {} @ market", placed[0].amount);

    // 5. Shutdown: feed stops, marker cleared, engine drains
    supervisor.stop_all().await;
    assert!(running_users(store.as_ref(), "mock").await.unwrap().is_empty());
    assert!(notifier.messages().is_empty());
    drop(supervisor);
    drop(reconciler);

    tokio::time::timeout(Duration::from_secs(2), engine_task)
        .await
        .expect("engine did not stop after feeds closed")
        .unwrap();
    println!("\n=== Sync Flow Test Complete ===");
}
