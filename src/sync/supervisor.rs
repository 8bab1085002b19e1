//! Start, stop and health of the streaming feed tasks, one set per user.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::BotError;
use crate::models::Credentials;
use crate::persistence::{active_symbols, set_running, SharedStore};
use crate::stream::{
    periodic_resync, Channel, FeedConfig, FeedEvent, FeedHandle, ReconnectPolicy, StreamingFeed,
    SubscriptionDelta, WsConnector,
};
use crate::Result;

/// Connection settings shared by every user's feeds
#[derive(Debug, Clone)]
pub struct FeedTemplate {
    pub private_url: String,
    /// Ticker feed; prices are only streamed when set
    pub public_url: Option<String>,
    pub inst_type: String,
    pub ping_interval: Duration,
    pub login_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub resync_interval: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedHealth {
    pub user: String,
    pub running: bool,
    pub subscriptions: usize,
}

#[derive(Clone)]
struct Registration {
    credentials: Credentials,
    events: mpsc::Sender<FeedEvent>,
}

struct UserFeeds {
    generation: u64,
    handles: Vec<FeedHandle>, // Private feed first
    tasks: Vec<JoinHandle<()>>,
}

pub struct FeedSupervisor {
    exchange: String,
    store: Arc<dyn SharedStore>,
    connector: Arc<dyn WsConnector>,
    template: FeedTemplate,
    users: Mutex<HashMap<String, Registration>>,
    feeds: Arc<Mutex<HashMap<String, UserFeeds>>>,
    generation: AtomicU64,
}

impl FeedSupervisor {
    pub fn new(
        exchange: &str,
        store: Arc<dyn SharedStore>,
        connector: Arc<dyn WsConnector>,
        template: FeedTemplate,
    ) -> Self {
        Self {
            exchange: exchange.to_string(),
            store,
            connector,
            template,
            users: Mutex::new(HashMap::new()),
            feeds: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Make a user startable; events of all their feeds go to `events`
    pub fn register(&self, user: &str, credentials: Credentials, events: mpsc::Sender<FeedEvent>) {
        lock(&self.users).insert(user.to_string(), Registration { credentials, events });
    }

    pub fn registered_users(&self) -> Vec<String> {
        let mut users: Vec<String> = lock(&self.users).keys().cloned().collect();
        users.sort();
        users
    }

    /// Spawn the user's feeds subscribed to their active symbols.
    ///
    /// No-op when the feeds are already healthy. Dead feeds are cleaned up first.
    pub async fn start(&self, user: &str) -> Result<()> {
        let registration = lock(&self.users)
            .get(user)
            .cloned()
            .ok_or_else(|| BotError::NotFound(format!("user {} not registered", user)))?;

        if self.is_healthy(user) {
            return Ok(());
        }
        self.stop(user).await;

        let desired = active_symbols(self.store.as_ref(), &self.exchange, user).await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let private = FeedConfig {
            name: user.to_string(),
            url: self.template.private_url.clone(),
            credentials: Some(registration.credentials.clone()),
            channels: Channel::private_defaults(&self.template.inst_type),
            ping_interval: self.template.ping_interval,
            login_timeout: self.template.login_timeout,
            reconnect: self.template.reconnect.clone(),
        };
        let (private_handle, private_task) =
            StreamingFeed::new(private, self.connector.clone(), registration.events.clone()).spawn();

        let mut handles = vec![private_handle.clone()];
        let mut tasks = vec![self.watch(user, generation, private_task)];

        if let Some(ref public_url) = self.template.public_url {
            let public = FeedConfig {
                name: format!("{}-public", user),
                url: public_url.clone(),
                credentials: None,
                channels: vec![Channel::new("tickers")],
                ping_interval: self.template.ping_interval,
                login_timeout: self.template.login_timeout,
                reconnect: self.template.reconnect.clone(),
            };
            let (handle, task) =
                StreamingFeed::new(public, self.connector.clone(), registration.events.clone())
                    .spawn();
            handles.push(handle);
            tasks.push(task);
        }

        if let Some(every) = self.template.resync_interval {
            for handle in &handles {
                tasks.push(tokio::spawn(periodic_resync(
                    handle.clone(),
                    self.store.clone(),
                    self.exchange.clone(),
                    user.to_string(),
                    every,
                )));
            }
        }

        lock(&self.feeds).insert(
            user.to_string(),
            UserFeeds {
                generation,
                handles: handles.clone(),
                tasks,
            },
        );

        // Marked before subscribing so the watcher's clear always comes after
        set_running(self.store.as_ref(), &self.exchange, user, true).await?;
        for handle in &handles {
            handle.subscribe(desired.clone()).await?;
        }

        tracing::info!(
            user = %user,
            symbols = desired.len(),
            feeds = handles.len(),
            "📡 Feeds started"
        );
        Ok(())
    }

    /// Clear the running marker once the private feed task ends, unless a
    /// newer start already replaced it
    fn watch(&self, user: &str, generation: u64, task: JoinHandle<()>) -> JoinHandle<()> {
        let feeds = self.feeds.clone();
        let store = self.store.clone();
        let exchange = self.exchange.clone();
        let user = user.to_string();

        tokio::spawn(async move {
            if let Err(e) = task.await {
                tracing::error!(user = %user, "Feed task panicked: {}", e);
            }
            let current = lock(&feeds).get(&user).map(|f| f.generation) == Some(generation);
            if current {
                tracing::warn!(user = %user, "Feed task ended, marking user not running");
                if let Err(e) = set_running(store.as_ref(), &exchange, &user, false).await {
                    tracing::warn!(user = %user, "Failed to clear running marker: {}", e);
                }
            }
        })
    }

    /// Stop every feed of the user. Returns false when nothing was running.
    pub async fn stop(&self, user: &str) -> bool {
        let feeds = match lock(&self.feeds).remove(user) {
            Some(feeds) => feeds,
            None => return false,
        };

        for handle in &feeds.handles {
            handle.stop().await;
        }
        // Resync loops hold no socket; the feed tasks close theirs on Stop
        for task in feeds.tasks.iter().skip(feeds.handles.len()) {
            task.abort();
        }
        if let Err(e) = set_running(self.store.as_ref(), &self.exchange, user, false).await {
            tracing::warn!(user = %user, "Failed to clear running marker: {}", e);
        }
        tracing::info!(user = %user, "🛑 Feeds stopped");
        true
    }

    pub async fn stop_all(&self) {
        let users: Vec<String> = lock(&self.feeds).keys().cloned().collect();
        for user in users {
            self.stop(&user).await;
        }
    }

    /// Feeds exist for the user, alive or not
    pub fn is_running(&self, user: &str) -> bool {
        lock(&self.feeds).contains_key(user)
    }

    /// Every feed of the user is alive
    pub fn is_healthy(&self, user: &str) -> bool {
        lock(&self.feeds)
            .get(user)
            .map(|f| f.handles.iter().all(|h| h.is_running()))
            .unwrap_or(false)
    }

    pub fn handles(&self, user: &str) -> Vec<FeedHandle> {
        lock(&self.feeds)
            .get(user)
            .map(|f| f.handles.clone())
            .unwrap_or_default()
    }

    /// Converge every feed of the user on `desired`; returns the private feed's delta
    pub async fn converge(&self, user: &str, desired: &BTreeSet<String>) -> Result<SubscriptionDelta> {
        let handles = self.handles(user);
        if handles.is_empty() {
            return Err(BotError::NotFound(format!("no feeds for user {}", user)));
        }
        let mut private_delta = None;
        for handle in &handles {
            let delta = handle.converge(desired.clone()).await?;
            private_delta.get_or_insert(delta);
        }
        Ok(private_delta.unwrap_or_default())
    }

    pub fn health(&self) -> Vec<FeedHealth> {
        let feeds = lock(&self.feeds);
        let mut health: Vec<FeedHealth> = feeds
            .iter()
            .map(|(user, f)| FeedHealth {
                user: user.clone(),
                running: f.handles.iter().all(|h| h.is_running()),
                subscriptions: f.handles.first().map(|h| h.subscriptions().len()).unwrap_or(0),
            })
            .collect();
        health.sort_by(|a, b| a.user.cmp(&b.user));
        health
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
