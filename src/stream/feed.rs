//! Authenticated streaming feed with tracked subscriptions.
//!
//! One spawned task owns the socket and the [`SubscriptionSet`]. Everything
//! else talks to it through a [`FeedHandle`], which sends commands over a
//! channel and reads a snapshot of the current subscriptions.

use super::backoff::ReconnectPolicy;
use super::frames::{login_frame, parse_event, subscription_frames, Channel, StreamEvent, SubscriptionOp};
use super::transport::{WsConnection, WsConnector};
use crate::api::signing::ws_timestamp;
use crate::error::BotError;
use crate::models::{Credentials, OrderReport, PositionSnapshot, Ticker};
use crate::persistence::{active_symbols, SharedStore};
use crate::Result;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Normalized update delivered to the consumer of a feed
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Order(OrderReport),
    Position(PositionSnapshot),
    Price(Ticker),
    /// A private feed logged in; pushes sent while it was down are lost
    Connected { feed: String },
}

/// Symbols added and removed by one subscription change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl SubscriptionDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Symbols a feed currently holds open, each subscribed on every channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    symbols: BTreeSet<String>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the set equal to `desired` and report what changed
    pub fn converge(&mut self, desired: &BTreeSet<String>) -> SubscriptionDelta {
        let added: Vec<String> = desired.difference(&self.symbols).cloned().collect();
        let removed: Vec<String> = self.symbols.difference(desired).cloned().collect();
        self.symbols = desired.clone();
        SubscriptionDelta { added, removed }
    }

    /// Drop the given symbols; unknown symbols are ignored
    pub fn remove(&mut self, symbols: &BTreeSet<String>) -> SubscriptionDelta {
        let removed: Vec<String> = self.symbols.intersection(symbols).cloned().collect();
        for symbol in &removed {
            self.symbols.remove(symbol);
        }
        SubscriptionDelta {
            added: Vec::new(),
            removed,
        }
    }

    pub fn symbols(&self) -> &BTreeSet<String> {
        &self.symbols
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.contains(symbol)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn clear(&mut self) {
        self.symbols.clear();
    }
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Label used in logs, usually the user id
    pub name: String,
    pub url: String,
    /// None for public endpoints that need no login
    pub credentials: Option<Credentials>,
    pub channels: Vec<Channel>,
    pub ping_interval: Duration,
    pub login_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

enum FeedCommand {
    Subscribe(BTreeSet<String>, oneshot::Sender<SubscriptionDelta>),
    Unsubscribe(BTreeSet<String>, oneshot::Sender<SubscriptionDelta>),
    Stop,
}

/// Why the read loop returned without an error
enum LoopExit {
    Stopped,
    ConsumerGone,
}

/// External face of a running feed task
#[derive(Clone)]
pub struct FeedHandle {
    name: String,
    commands: mpsc::Sender<FeedCommand>,
    subscriptions: Arc<RwLock<BTreeSet<String>>>,
    running: Arc<AtomicBool>,
}

impl FeedHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Track exactly `symbols`; only changed memberships go on the wire
    pub async fn subscribe(&self, symbols: BTreeSet<String>) -> Result<SubscriptionDelta> {
        let (reply, rx) = oneshot::channel();
        self.send(FeedCommand::Subscribe(symbols, reply)).await?;
        rx.await.map_err(|_| BotError::ConnectionClosed)
    }

    pub async fn unsubscribe(&self, symbols: BTreeSet<String>) -> Result<SubscriptionDelta> {
        let (reply, rx) = oneshot::channel();
        self.send(FeedCommand::Unsubscribe(symbols, reply)).await?;
        rx.await.map_err(|_| BotError::ConnectionClosed)
    }

    /// Subscribe to the desired set, reporting any difference as drift
    pub async fn converge(&self, desired: BTreeSet<String>) -> Result<SubscriptionDelta> {
        let delta = self.subscribe(desired).await?;
        if !delta.is_empty() {
            let drift = BotError::ReconciliationDrift(format!(
                "feed {} added {:?} removed {:?}",
                self.name, delta.added, delta.removed
            ));
            tracing::warn!(feed = %self.name, "{}", drift);
        }
        Ok(delta)
    }

    /// Converge on the active-symbol set recorded in the shared store
    pub async fn resync_from_store(
        &self,
        store: &dyn SharedStore,
        exchange: &str,
        user: &str,
    ) -> Result<SubscriptionDelta> {
        let desired = active_symbols(store, exchange, user).await?;
        self.converge(desired).await
    }

    /// Ask the task to close its socket and exit
    pub async fn stop(&self) {
        let _ = self.commands.send(FeedCommand::Stop).await;
    }

    /// Snapshot of the current subscription set
    pub fn subscriptions(&self) -> BTreeSet<String> {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn send(&self, command: FeedCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| BotError::ConnectionClosed)
    }
}

/// Periodically converge a feed on the shared store until the feed ends
pub async fn periodic_resync(
    handle: FeedHandle,
    store: Arc<dyn SharedStore>,
    exchange: String,
    user: String,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !handle.is_running() {
            tracing::debug!(feed = %handle.name(), "Feed ended, resync loop exiting");
            return;
        }
        if let Err(e) = handle.resync_from_store(store.as_ref(), &exchange, &user).await {
            tracing::warn!(feed = %handle.name(), "Resync failed: {}", e);
        }
    }
}

pub struct StreamingFeed {
    config: FeedConfig,
    connector: Arc<dyn WsConnector>,
    events: mpsc::Sender<FeedEvent>,
    set: SubscriptionSet,
    snapshot: Arc<RwLock<BTreeSet<String>>>,
    running: Arc<AtomicBool>,
}

impl StreamingFeed {
    pub fn new(
        config: FeedConfig,
        connector: Arc<dyn WsConnector>,
        events: mpsc::Sender<FeedEvent>,
    ) -> Self {
        Self {
            config,
            connector,
            events,
            set: SubscriptionSet::new(),
            snapshot: Arc::new(RwLock::new(BTreeSet::new())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the feed task
    pub fn spawn(self) -> (FeedHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let handle = FeedHandle {
            name: self.config.name.clone(),
            commands: tx,
            subscriptions: self.snapshot.clone(),
            running: self.running.clone(),
        };
        self.running.store(true, Ordering::SeqCst);
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<FeedCommand>) {
        let name = self.config.name.clone();
        tracing::info!(feed = %name, url = %self.config.url, "Feed task started");

        'outer: loop {
            match self.connect().await {
                Ok(mut conn) => {
                    self.config.reconnect.reset();
                    if self.config.credentials.is_some()
                        && self
                            .events
                            .send(FeedEvent::Connected { feed: name.clone() })
                            .await
                            .is_err()
                    {
                        tracing::warn!(feed = %name, "Event consumer dropped, stopping feed");
                        conn.close().await;
                        break 'outer;
                    }
                    let outcome = match self.resubscribe_all(&mut *conn).await {
                        Ok(()) => self.handle_messages(&mut *conn, &mut commands).await,
                        Err(e) => Err(e),
                    };
                    match outcome {
                        Ok(exit) => {
                            conn.close().await;
                            match exit {
                                LoopExit::Stopped => tracing::info!(feed = %name, "Feed stopped"),
                                LoopExit::ConsumerGone => {
                                    tracing::warn!(feed = %name, "Event consumer dropped, stopping feed")
                                }
                            }
                            break 'outer;
                        }
                        Err(e) => {
                            tracing::warn!(feed = %name, "Connection lost: {}", e);
                            conn.close().await;
                        }
                    }
                }
                Err(e) if e.is_fatal_for_connection() => {
                    tracing::error!(feed = %name, "Login rejected, rebuilding connection: {}", e);
                }
                Err(e) => {
                    tracing::warn!(feed = %name, "Connect failed: {}", e);
                }
            }

            let delay = match self.config.reconnect.next_delay() {
                Some(delay) => delay,
                None => {
                    tracing::error!(
                        feed = %name,
                        attempts = self.config.reconnect.attempts(),
                        "Reconnect budget exhausted, feed task terminating"
                    );
                    break 'outer;
                }
            };
            tracing::info!(
                feed = %name,
                attempt = self.config.reconnect.attempts(),
                "Reconnecting in {:?}",
                delay
            );

            // Keep serving commands while waiting; the set is replayed on reconnect
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = commands.recv() => match command {
                        Some(FeedCommand::Stop) | None => break 'outer,
                        Some(command) => { self.apply_offline(command); }
                    },
                }
            }
        }

        self.set.clear();
        self.publish();
        self.running.store(false, Ordering::SeqCst);
        tracing::info!(feed = %name, "Feed task exited");
    }

    /// Open a socket and, for private feeds, wait for the login result
    pub(crate) async fn connect(&self) -> Result<Box<dyn WsConnection>> {
        let mut conn = self.connector.connect(&self.config.url).await?;

        let credentials = match self.config.credentials {
            Some(ref credentials) => credentials,
            None => return Ok(conn),
        };

        conn.send_text(login_frame(credentials, &ws_timestamp(Utc::now())))
            .await?;

        let wait = tokio::time::timeout(self.config.login_timeout, async {
            loop {
                let text = conn.next_text().await?.ok_or(BotError::ConnectionClosed)?;
                match parse_event(&text) {
                    Ok(StreamEvent::Login) => return Ok::<(), BotError>(()),
                    Ok(StreamEvent::Error { code, message }) => {
                        return Err(BotError::Authentication(format!("{}: {}", code, message)))
                    }
                    Ok(other) => tracing::debug!("Ignoring {:?} before login", other),
                    Err(e) => tracing::warn!("Skipping frame before login: {}", e),
                }
            }
        })
        .await;

        match wait {
            Ok(Ok(())) => {
                tracing::info!(feed = %self.config.name, "Login succeeded");
                Ok(conn)
            }
            Ok(Err(e)) => {
                conn.close().await;
                Err(e)
            }
            Err(_) => {
                conn.close().await;
                Err(BotError::TransientNetwork(format!(
                    "no login response within {:?}",
                    self.config.login_timeout
                )))
            }
        }
    }

    /// Replay the whole tracked set on a fresh socket
    async fn resubscribe_all(&mut self, conn: &mut dyn WsConnection) -> Result<()> {
        if self.set.is_empty() {
            return Ok(());
        }
        let symbols: Vec<String> = self.set.symbols().iter().cloned().collect();
        tracing::info!(feed = %self.config.name, count = symbols.len(), "Resubscribing tracked symbols");
        self.send_op(conn, SubscriptionOp::Subscribe, &symbols).await
    }

    /// Read loop for one connection. Returns Err when the socket must be replaced.
    async fn handle_messages(
        &mut self,
        conn: &mut dyn WsConnection,
        commands: &mut mpsc::Receiver<FeedCommand>,
    ) -> Result<LoopExit> {
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.tick().await;

        loop {
            tokio::select! {
                frame = conn.next_text() => {
                    let text = frame?.ok_or(BotError::ConnectionClosed)?;
                    if let Some(exit) = self.dispatch(&text).await {
                        return Ok(exit);
                    }
                }
                command = commands.recv() => match command {
                    Some(FeedCommand::Subscribe(desired, reply)) => {
                        let delta = self.set.converge(&desired);
                        self.publish();
                        self.send_delta(conn, &delta).await?;
                        let _ = reply.send(delta);
                    }
                    Some(FeedCommand::Unsubscribe(symbols, reply)) => {
                        let delta = self.set.remove(&symbols);
                        self.publish();
                        self.send_delta(conn, &delta).await?;
                        let _ = reply.send(delta);
                    }
                    Some(FeedCommand::Stop) | None => return Ok(LoopExit::Stopped),
                },
                _ = ping.tick() => {
                    conn.send_text("ping".to_string()).await?;
                }
            }
        }
    }

    /// Handle one inbound frame. Bad frames are logged and skipped.
    async fn dispatch(&self, text: &str) -> Option<LoopExit> {
        let event = match parse_event(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(feed = %self.config.name, "Skipping message: {}", e);
                return None;
            }
        };

        let updates: Vec<FeedEvent> = match event {
            StreamEvent::Orders(reports) => reports.into_iter().map(FeedEvent::Order).collect(),
            StreamEvent::Positions(snapshots) => {
                snapshots.into_iter().map(FeedEvent::Position).collect()
            }
            StreamEvent::Tickers(tickers) => tickers.into_iter().map(FeedEvent::Price).collect(),
            StreamEvent::Error { code, message } => {
                tracing::warn!(feed = %self.config.name, code = %code, "Exchange error event: {}", message);
                return None;
            }
            StreamEvent::Subscribed { channel, symbol } => {
                tracing::debug!(feed = %self.config.name, channel = %channel, symbol = ?symbol, "Subscribed");
                return None;
            }
            StreamEvent::Unsubscribed { channel, symbol } => {
                tracing::debug!(feed = %self.config.name, channel = %channel, symbol = ?symbol, "Unsubscribed");
                return None;
            }
            StreamEvent::Notice(text) => {
                tracing::info!(feed = %self.config.name, "Notice: {}", text);
                return None;
            }
            StreamEvent::Login | StreamEvent::Pong => return None,
        };

        for update in updates {
            if self.events.send(update).await.is_err() {
                return Some(LoopExit::ConsumerGone);
            }
        }
        None
    }

    fn apply_offline(&mut self, command: FeedCommand) {
        match command {
            FeedCommand::Subscribe(desired, reply) => {
                let delta = self.set.converge(&desired);
                self.publish();
                let _ = reply.send(delta);
            }
            FeedCommand::Unsubscribe(symbols, reply) => {
                let delta = self.set.remove(&symbols);
                self.publish();
                let _ = reply.send(delta);
            }
            FeedCommand::Stop => {}
        }
    }

    async fn send_delta(&self, conn: &mut dyn WsConnection, delta: &SubscriptionDelta) -> Result<()> {
        if !delta.added.is_empty() {
            self.send_op(conn, SubscriptionOp::Subscribe, &delta.added).await?;
        }
        if !delta.removed.is_empty() {
            self.send_op(conn, SubscriptionOp::Unsubscribe, &delta.removed).await?;
        }
        Ok(())
    }

    async fn send_op(
        &self,
        conn: &mut dyn WsConnection,
        op: SubscriptionOp,
        symbols: &[String],
    ) -> Result<()> {
        for frame in subscription_frames(op, &self.config.channels, symbols) {
            conn.send_text(frame).await?;
        }
        tracing::debug!(feed = %self.config.name, op = op.as_str(), symbols = ?symbols, "Sent subscription change");
        Ok(())
    }

    fn publish(&self) {
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = self.set.symbols().clone();
    }
}
