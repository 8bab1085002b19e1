//! Periodic self-healing of the feed tasks against the shared store.
//!
//! Per user and per tick: no desired symbols stops the feeds, dead feeds are
//! restarted, live feeds are converged on the desired set.

use std::sync::Arc;
use std::time::Duration;

use super::supervisor::FeedSupervisor;
use crate::error::BotError;
use crate::persistence::{active_symbols, running_users, set_running, SharedStore};

/// What one reconciliation pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub restarted: Vec<String>,
    pub stopped: Vec<String>,
    pub converged: Vec<String>,
    /// Users whose live subscriptions differed from the store
    pub drifted: Vec<String>,
}

pub struct ReconciliationLoop {
    supervisor: Arc<FeedSupervisor>,
    store: Arc<dyn SharedStore>,
    exchange: String,
    interval: Duration,
}

impl ReconciliationLoop {
    pub fn new(
        supervisor: Arc<FeedSupervisor>,
        store: Arc<dyn SharedStore>,
        exchange: &str,
        interval: Duration,
    ) -> Self {
        Self {
            supervisor,
            store,
            exchange: exchange.to_string(),
            interval,
        }
    }

    /// Run forever, one pass per interval. The first pass runs at once.
    pub async fn run(self) {
        tracing::info!(
            exchange = %self.exchange,
            "🔄 Reconciliation loop started (every {:?})",
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            let report = self.reconcile_once().await;
            if report != ReconcileReport::default() {
                tracing::debug!("Reconciliation pass: {:?}", report);
            }
        }
    }

    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let marked = match running_users(self.store.as_ref(), &self.exchange).await {
            Ok(marked) => marked,
            Err(e) => {
                tracing::warn!("Cannot read running markers: {}", e);
                Default::default()
            }
        };

        for user in self.supervisor.registered_users() {
            let desired = match active_symbols(self.store.as_ref(), &self.exchange, &user).await {
                Ok(desired) => desired,
                Err(e) => {
                    tracing::warn!(user = %user, "Cannot read active symbols, skipping: {}", e);
                    continue;
                }
            };

            if desired.is_empty() {
                if self.supervisor.stop(&user).await {
                    tracing::info!(user = %user, "No active symbols, feeds stopped");
                    report.stopped.push(user);
                }
                continue;
            }

            if !self.supervisor.is_healthy(&user) {
                let drift = BotError::ReconciliationDrift(format!(
                    "{} wants {} symbols but has no live feed",
                    user,
                    desired.len()
                ));
                tracing::warn!(user = %user, "{}", drift);
                match self.supervisor.start(&user).await {
                    Ok(()) => report.restarted.push(user),
                    Err(e) => tracing::error!(user = %user, "Restart failed: {}", e),
                }
                continue;
            }

            if !marked.contains(&user) {
                tracing::warn!(user = %user, "Live feed missing its running marker, restoring");
                if let Err(e) = set_running(self.store.as_ref(), &self.exchange, &user, true).await {
                    tracing::warn!(user = %user, "Failed to restore running marker: {}", e);
                }
            }

            match self.supervisor.converge(&user, &desired).await {
                Ok(delta) => {
                    if !delta.is_empty() {
                        report.drifted.push(user.clone());
                    }
                    report.converged.push(user);
                }
                Err(e) => tracing::warn!(user = %user, "Converge failed: {}", e),
            }
        }

        // Markers left behind by crashed processes or unregistered users
        for user in marked {
            if !self.supervisor.is_running(&user) {
                tracing::warn!(user = %user, "Stale running marker, clearing");
                if let Err(e) = set_running(self.store.as_ref(), &self.exchange, &user, false).await {
                    tracing::warn!(user = %user, "Failed to clear running marker: {}", e);
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{activate_symbol, deactivate_symbol, MemoryStore};
    use crate::stream::feed::test_support::{credentials, ScriptedConnector, LOGIN_OK};
    use crate::stream::ReconnectPolicy;
    use crate::sync::FeedTemplate;
    use tokio::sync::mpsc;

    fn template() -> FeedTemplate {
        FeedTemplate {
            private_url: "wss://test/ws/v5/private".to_string(),
            public_url: None,
            inst_type: "SWAP".to_string(),
            ping_interval: Duration::from_secs(3600),
            login_timeout: Duration::from_millis(500),
            reconnect: ReconnectPolicy::new(
                Duration::from_millis(5),
                Duration::from_millis(10),
                2.0,
                0.0,
                1,
            ),
            resync_interval: None,
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        connector: Arc<ScriptedConnector>,
        reconciler: ReconciliationLoop,
        supervisor: Arc<FeedSupervisor>,
        _events: mpsc::Receiver<crate::stream::FeedEvent>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let connector = Arc::new(ScriptedConnector::new());
        let supervisor = Arc::new(FeedSupervisor::new(
            "okx",
            store.clone(),
            connector.clone(),
            template(),
        ));
        let (tx, rx) = mpsc::channel(16);
        supervisor.register("u1", credentials(), tx);
        let reconciler =
            ReconciliationLoop::new(supervisor.clone(), store.clone(), "okx", Duration::from_secs(30));
        Fixture {
            store,
            connector,
            reconciler,
            supervisor,
            _events: rx,
        }
    }

    #[tokio::test]
    async fn test_starts_converges_and_stops() {
        let f = fixture();
        activate_symbol(f.store.as_ref(), "okx", "u1", "BTC-USDT-SWAP").await.unwrap();

        let mut server = f.connector.prepare();
        let responder = tokio::spawn(async move {
            server.next_sent().await;
            server.reply(LOGIN_OK);
            server.next_sent().await;
            server
        });

        let report = f.reconciler.reconcile_once().await;
        assert_eq!(report.restarted, vec!["u1".to_string()]);
        let mut server = responder.await.unwrap();

        // A symbol added in the store shows up on the next pass
        activate_symbol(f.store.as_ref(), "okx", "u1", "ETH-USDT-SWAP").await.unwrap();
        let report = f.reconciler.reconcile_once().await;
        assert_eq!(report.drifted, vec!["u1".to_string()]);
        let frame = server.next_sent().await;
        assert!(frame.contains("ETH-USDT-SWAP"));
        assert!(!frame.contains("BTC-USDT-SWAP"));

        // Nothing left to trade: the feed is stopped
        deactivate_symbol(f.store.as_ref(), "okx", "u1", "BTC-USDT-SWAP").await.unwrap();
        deactivate_symbol(f.store.as_ref(), "okx", "u1", "ETH-USDT-SWAP").await.unwrap();
        let report = f.reconciler.reconcile_once().await;
        assert_eq!(report.stopped, vec!["u1".to_string()]);
        assert!(!f.supervisor.is_running("u1"));
    }

    #[tokio::test]
    async fn test_dead_feed_is_restarted() {
        let f = fixture();
        activate_symbol(f.store.as_ref(), "okx", "u1", "BTC-USDT-SWAP").await.unwrap();

        // First start has no server and dies after its budget
        f.supervisor.start("u1").await.unwrap();
        for _ in 0..50 {
            if !f.supervisor.is_healthy("u1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!f.supervisor.is_healthy("u1"));

        let mut server = f.connector.prepare();
        let responder = tokio::spawn(async move {
            server.next_sent().await;
            server.reply(LOGIN_OK);
            server.next_sent().await
        });

        let report = f.reconciler.reconcile_once().await;
        assert_eq!(report.restarted, vec!["u1".to_string()]);
        assert!(responder.await.unwrap().contains("BTC-USDT-SWAP"));
        assert!(f.supervisor.is_healthy("u1"));
    }

    #[tokio::test]
    async fn test_stale_marker_is_cleared() {
        let f = fixture();
        set_running(f.store.as_ref(), "okx", "ghost", true).await.unwrap();

        f.reconciler.reconcile_once().await;
        assert!(running_users(f.store.as_ref(), "okx").await.unwrap().is_empty());
    }
}
