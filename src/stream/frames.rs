//! Outbound control frames and inbound event parsing for the private and
//! public streaming endpoints.

use crate::api::signing::sign_ws_login;
use crate::api::wire::{RawOrder, RawPosition, RawTicker};
use crate::error::BotError;
use crate::models::{Credentials, OrderReport, PositionSnapshot, Ticker};
use crate::Result;
use serde::Deserialize;
use serde_json::{json, Value};

/// Arguments per subscribe frame; large sets are split across frames
pub const MAX_ARGS_PER_FRAME: usize = 50;

/// A channel subscribed once per tracked symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub name: String,
    pub inst_type: Option<String>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inst_type: None,
        }
    }

    pub fn with_inst_type(mut self, inst_type: impl Into<String>) -> Self {
        self.inst_type = Some(inst_type.into());
        self
    }

    /// `orders` and `positions` on the private endpoint
    pub fn private_defaults(inst_type: &str) -> Vec<Channel> {
        vec![
            Channel::new("orders").with_inst_type(inst_type),
            Channel::new("positions").with_inst_type(inst_type),
        ]
    }

    fn arg(&self, symbol: &str) -> Value {
        match self.inst_type {
            Some(ref inst_type) => json!({
                "channel": self.name,
                "instType": inst_type,
                "instId": symbol,
            }),
            None => json!({ "channel": self.name, "instId": symbol }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionOp {
    Subscribe,
    Unsubscribe,
}

impl SubscriptionOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionOp::Subscribe => "subscribe",
            SubscriptionOp::Unsubscribe => "unsubscribe",
        }
    }
}

pub fn login_frame(credentials: &Credentials, timestamp: &str) -> String {
    json!({
        "op": "login",
        "args": [{
            "apiKey": credentials.api_key,
            "passphrase": credentials.passphrase,
            "timestamp": timestamp,
            "sign": sign_ws_login(&credentials.secret, timestamp),
        }]
    })
    .to_string()
}

/// One frame per chunk of (channel, symbol) arguments
pub fn subscription_frames(
    op: SubscriptionOp,
    channels: &[Channel],
    symbols: &[String],
) -> Vec<String> {
    let args: Vec<Value> = symbols
        .iter()
        .flat_map(|symbol| channels.iter().map(move |channel| channel.arg(symbol)))
        .collect();

    args.chunks(MAX_ARGS_PER_FRAME)
        .map(|chunk| json!({ "op": op.as_str(), "args": chunk }).to_string())
        .collect()
}

/// Normalized inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Login,
    Error { code: String, message: String },
    Subscribed { channel: String, symbol: Option<String> },
    Unsubscribed { channel: String, symbol: Option<String> },
    /// Informational events such as connection counts or maintenance notices
    Notice(String),
    Orders(Vec<OrderReport>),
    Positions(Vec<PositionSnapshot>),
    Tickers(Vec<Ticker>),
    Pong,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawArg {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    inst_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    arg: Option<RawArg>,
    #[serde(default)]
    data: Option<Vec<Value>>,
}

/// Parse one text frame.
///
/// Unknown events and channels come back as `MalformedMessage`; the caller
/// logs and skips them.
pub fn parse_event(text: &str) -> Result<StreamEvent> {
    if text == "pong" {
        return Ok(StreamEvent::Pong);
    }

    let frame: RawFrame = serde_json::from_str(text)?;

    if let Some(event) = frame.event.as_deref() {
        let arg = frame.arg;
        return match event {
            "login" => match frame.code.as_deref() {
                None | Some("0") => Ok(StreamEvent::Login),
                Some(code) => Ok(StreamEvent::Error {
                    code: code.to_string(),
                    message: frame.msg.unwrap_or_default(),
                }),
            },
            "error" => Ok(StreamEvent::Error {
                code: frame.code.unwrap_or_default(),
                message: frame.msg.unwrap_or_default(),
            }),
            "subscribe" | "unsubscribe" => {
                let arg = arg.ok_or_else(|| {
                    BotError::MalformedMessage(format!("{} ack without arg", event))
                })?;
                let (channel, symbol) = (arg.channel, arg.inst_id);
                Ok(if event == "subscribe" {
                    StreamEvent::Subscribed { channel, symbol }
                } else {
                    StreamEvent::Unsubscribed { channel, symbol }
                })
            }
            "channel-conn-count" | "channel-conn-count-error" | "notice" => {
                Ok(StreamEvent::Notice(text.to_string()))
            }
            other => Err(BotError::MalformedMessage(format!("unknown event {:?}", other))),
        };
    }

    let (arg, data) = match (frame.arg, frame.data) {
        (Some(arg), Some(data)) => (arg, data),
        _ => {
            return Err(BotError::MalformedMessage(format!(
                "frame without event or data: {}",
                truncate(text)
            )))
        }
    };

    match arg.channel.as_str() {
        "orders" => Ok(StreamEvent::Orders(decode_records::<RawOrder, _>(
            data,
            RawOrder::into_report,
        ))),
        "positions" => Ok(StreamEvent::Positions(decode_records::<RawPosition, _>(
            data,
            RawPosition::into_snapshot,
        ))),
        "tickers" => Ok(StreamEvent::Tickers(decode_records::<RawTicker, _>(
            data,
            RawTicker::into_ticker,
        ))),
        other => Err(BotError::MalformedMessage(format!("unknown channel {:?}", other))),
    }
}

/// Decode each record on its own so one bad entry does not drop its neighbours
fn decode_records<R, T>(data: Vec<Value>, convert: fn(R) -> Result<T>) -> Vec<T>
where
    R: serde::de::DeserializeOwned,
{
    data.into_iter()
        .filter_map(|value| {
            let decoded = serde_json::from_value::<R>(value)
                .map_err(BotError::from)
                .and_then(convert);
            match decoded {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!("Skipping malformed record: {}", e);
                    None
                }
            }
        })
        .collect()
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(120) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
