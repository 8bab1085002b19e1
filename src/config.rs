//! Runtime settings.
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! `perpbot.toml`, then `PERPBOT__SECTION__KEY` environment variables.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::BotError;
use crate::execution::{AccumulationConfig, ControllerSettings, HedgeConfig};
use crate::models::Credentials;
use crate::risk::RiskParams;
use crate::stream::ReconnectPolicy;
use crate::sync::FeedTemplate;
use crate::Result;

pub const ENV_PREFIX: &str = "PERPBOT";
pub const DEFAULT_CONFIG_FILE: &str = "perpbot";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub name: String,
    pub rest_url: String,
    pub ws_private_url: String,
    pub ws_public_url: Option<String>,
    /// Default account, used by users without their own entry in `accounts`
    pub credentials: Option<Credentials>,
    pub simulated: bool, // Demo trading environment
    pub inst_type: String,
    pub td_mode: String,
    pub requests_per_second: u32,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            name: "okx".to_string(),
            rest_url: "https://www.okx.com".to_string(),
            ws_private_url: "wss://ws.okx.com:8443/ws/v5/private".to_string(),
            ws_public_url: Some("wss://ws.okx.com:8443/ws/v5/public".to_string()),
            credentials: None,
            simulated: false,
            inst_type: "SWAP".to_string(),
            td_mode: "cross".to_string(),
            requests_per_second: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
    pub connect_timeout_secs: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub ping_interval_secs: u64,
    pub login_timeout_secs: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_secs: u64,
    pub reconnect_multiplier: f64,
    pub reconnect_jitter: f64,
    pub max_reconnect_attempts: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            ping_interval_secs: 25, // Server drops idle sockets after 30s
            login_timeout_secs: 10,
            reconnect_initial_ms: 1_000,
            reconnect_max_secs: 60,
            reconnect_multiplier: 2.0,
            reconnect_jitter: 0.2,
            max_reconnect_attempts: 10,
        }
    }
}

impl StreamSettings {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_initial_ms),
            Duration::from_secs(self.reconnect_max_secs),
            self.reconnect_multiplier,
            self.reconnect_jitter,
            self.max_reconnect_attempts,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub resync_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub order_sweep_interval_secs: u64,
    pub stale_order_max_age_secs: u64,
    /// Orders quiet for this long get a REST status poll on the sweep tick
    pub order_poll_age_secs: u64,
    pub signal_poll_interval_secs: u64,
    pub event_buffer: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            resync_interval_secs: 30,
            reconcile_interval_secs: 30,
            order_sweep_interval_secs: 60,
            stale_order_max_age_secs: 3_600,
            order_poll_age_secs: 30,
            signal_poll_interval_secs: 15,
            event_buffer: 1_024,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub exchange: ExchangeSettings,
    pub redis: RedisSettings,
    pub stream: StreamSettings,
    pub sync: SyncSettings,
    pub users: Vec<String>,
    /// Per-user accounts, keyed by user id
    pub accounts: HashMap<String, Credentials>,
    pub risk: RiskParams,
    pub accumulation: AccumulationConfig,
    pub hedge: HedgeConfig,
}

impl Settings {
    /// Load `perpbot.toml` (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("users"),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse TOML text on top of the defaults, without the environment
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.risk.validate()?;
        self.accumulation.validate()?;
        self.hedge.validate()?;

        if self.stream.ping_interval_secs == 0 || self.stream.login_timeout_secs == 0 {
            return Err(BotError::Config(
                "stream ping_interval_secs and login_timeout_secs must be > 0".into(),
            ));
        }
        if self.sync.reconcile_interval_secs == 0
            || self.sync.order_sweep_interval_secs == 0
            || self.sync.signal_poll_interval_secs == 0
        {
            return Err(BotError::Config("sync intervals must be > 0".into()));
        }
        if self.sync.event_buffer == 0 {
            return Err(BotError::Config("sync event_buffer must be > 0".into()));
        }
        for user in &self.users {
            if self.credentials_for(user).is_none() {
                return Err(BotError::Config(format!("no credentials for user {}", user)));
            }
        }
        Ok(())
    }

    /// The user's own account, else the exchange default
    pub fn credentials_for(&self, user: &str) -> Option<Credentials> {
        self.accounts
            .get(user)
            .or(self.exchange.credentials.as_ref())
            .cloned()
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            accumulation: self.accumulation.clone(),
            hedge: self.hedge.clone(),
            risk: self.risk.clone(),
        }
    }

    pub fn feed_template(&self) -> FeedTemplate {
        FeedTemplate {
            private_url: self.exchange.ws_private_url.clone(),
            public_url: self.exchange.ws_public_url.clone(),
            inst_type: self.exchange.inst_type.clone(),
            ping_interval: Duration::from_secs(self.stream.ping_interval_secs),
            login_timeout: Duration::from_secs(self.stream.login_timeout_secs),
            reconnect: self.stream.reconnect_policy(),
            resync_interval: match self.sync.resync_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}
