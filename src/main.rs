use anyhow::Context;
use perpbot::api::{ClientRegistry, ExchangeClient, OkxRestClient};
use perpbot::config::Settings;
use perpbot::execution::{OrderManager, TradingEngine};
use perpbot::notify::{LogNotifier, Notifier};
use perpbot::persistence::{active_symbols, InstrumentCache, LogRecorder, RedisStore, SharedStore};
use perpbot::stream::TungsteniteConnector;
use perpbot::strategy::{read_signal, SignalUpdate};
use perpbot::sync::{FeedSupervisor, ReconciliationLoop};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    tracing::info!("🚀 PerpBot starting");

    let settings = Settings::load().context("loading configuration")?;
    let exchange = settings.exchange.name.clone();
    if settings.users.is_empty() {
        anyhow::bail!("no users configured (set PERPBOT__USERS or `users` in perpbot.toml)");
    }

    let store: Arc<dyn SharedStore> = Arc::new(
        RedisStore::new(
            &settings.redis.url,
            Duration::from_secs(settings.redis.connect_timeout_secs),
        )
        .await
        .context("connecting to Redis")?,
    );

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Exchange: {} ({})", exchange, settings.exchange.inst_type);
    tracing::info!("  Simulated: {}", settings.exchange.simulated);
    tracing::info!("  Users: {}", settings.users.len());
    tracing::info!(
        "  Accumulation: {:?}, {} entries max, x{} sizing",
        settings.accumulation.mode,
        settings.accumulation.entry_limit,
        settings.accumulation.entry_size_multiplier
    );
    tracing::info!("  Hedge: {}", if settings.hedge.enabled { "on" } else { "off" });
    tracing::info!("  Stop Loss: {:?}%", settings.risk.stop_loss_pct);

    let supervisor = Arc::new(FeedSupervisor::new(
        &exchange,
        store.clone(),
        Arc::new(TungsteniteConnector),
        settings.feed_template(),
    ));
    let registry = ClientRegistry::new();
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let controller_settings = Arc::new(settings.controller_settings());
    let mut instrument_caches: HashMap<String, Arc<InstrumentCache>> = HashMap::new();

    tracing::info!("\n🔄 Spawning per-user loops...");

    let mut engine_tasks = Vec::new();
    for user in &settings.users {
        let credentials = settings
            .credentials_for(user)
            .with_context(|| format!("no credentials for {}", user))?;
        let client = registry.open(&credentials, |creds| build_client(&settings, creds));

        // Users on the same account share one cache
        let instruments = instrument_caches
            .entry(perpbot::api::credential_fingerprint(&credentials))
            .or_insert_with(|| Arc::new(InstrumentCache::new(store.clone(), client.clone())))
            .clone();

        let orders = Arc::new(
            OrderManager::new(
                user.as_str(),
                client,
                Arc::new(LogRecorder),
                chrono::Duration::seconds(settings.sync.stale_order_max_age_secs as i64),
            )
            .with_instruments(instruments),
        );

        let mut engine =
            TradingEngine::new(user, orders, controller_settings.clone(), notifier.clone())
                .with_order_poll_age(chrono::Duration::seconds(
                    settings.sync.order_poll_age_secs as i64,
                ));
        if let Err(e) = engine.sync_positions().await {
            tracing::warn!(user = %user, "Initial position sync failed: {}", e);
        }

        let (feed_tx, feed_rx) = mpsc::channel(settings.sync.event_buffer);
        let (signal_tx, signal_rx) = mpsc::channel(64);
        supervisor.register(user, credentials, feed_tx);

        let sweep = Duration::from_secs(settings.sync.order_sweep_interval_secs);
        engine_tasks.push(tokio::spawn(engine.run(feed_rx, signal_rx, sweep)));

        tokio::spawn(signal_poll_loop(
            store.clone(),
            exchange.clone(),
            user.clone(),
            signal_tx,
            Duration::from_secs(settings.sync.signal_poll_interval_secs),
        ));

        tracing::info!("    - {} ready", user);
    }

    let reconcile_task = {
        let reconciler = ReconciliationLoop::new(
            supervisor.clone(),
            store.clone(),
            &exchange,
            Duration::from_secs(settings.sync.reconcile_interval_secs),
        );
        tokio::spawn(reconciler.run())
    };

    tracing::info!("✅ All loops spawned successfully");
    tracing::info!(
        "  🔄 Reconciliation: every {}s",
        settings.sync.reconcile_interval_secs
    );
    tracing::info!("  💹 Engines: {}", engine_tasks.len());
    tracing::info!("\nPress Ctrl+C to stop...\n");

    let engines = futures_util::future::select_all(engine_tasks);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
        }
        result = reconcile_task => {
            tracing::error!("Reconciliation loop exited: {:?}", result);
        }
        (result, index, _) = engines => {
            tracing::error!("Engine {} exited: {:?}", index, result);
        }
    }

    supervisor.stop_all().await;
    tracing::info!("👋 PerpBot stopped");
    Ok(())
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("perpbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_client(
    settings: &Settings,
    credentials: &perpbot::models::Credentials,
) -> Arc<dyn ExchangeClient> {
    Arc::new(
        OkxRestClient::new(credentials.clone())
            .with_base_url(settings.exchange.rest_url.clone())
            .with_rate_limit(settings.exchange.requests_per_second)
            .with_inst_type(settings.exchange.inst_type.clone())
            .with_td_mode(settings.exchange.td_mode.clone())
            .simulated(settings.exchange.simulated),
    )
}

// ============================================================================
// Signal Loop
// ============================================================================

/// Forward newly published indicator readings for the user's active symbols
async fn signal_poll_loop(
    store: Arc<dyn SharedStore>,
    exchange: String,
    user: String,
    signals: mpsc::Sender<SignalUpdate>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    let mut last_seen: HashMap<String, chrono::DateTime<chrono::Utc>> = HashMap::new();

    loop {
        ticker.tick().await;

        let symbols = match active_symbols(store.as_ref(), &exchange, &user).await {
            Ok(symbols) => symbols,
            Err(e) => {
                tracing::warn!(user = %user, "Failed to read active symbols: {}", e);
                continue;
            }
        };

        for symbol in symbols {
            let signal = match read_signal(store.as_ref(), &exchange, &symbol).await {
                Ok(Some(signal)) => signal,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(symbol = %symbol, "Signal read failed: {}", e);
                    continue;
                }
            };
            if last_seen.get(&symbol) == Some(&signal.timestamp) {
                continue;
            }
            last_seen.insert(symbol.clone(), signal.timestamp);

            if signals.send(signal).await.is_err() {
                tracing::info!(user = %user, "Engine gone, signal loop exiting");
                return;
            }
        }
    }
}
