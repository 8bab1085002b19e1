//! Raw exchange records shared by REST responses and stream pushes.
//!
//! The exchange encodes every number as a string and uses empty strings for
//! absent values, so records are decoded as strings first and normalized here.

use crate::error::BotError;
use crate::models::{
    Balance, Candle, InstrumentInfo, OrderReport, OrderStatus, OrderType, PositionSide,
    PositionSnapshot, Side, Ticker,
};
use crate::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

/// `{"code":"0","msg":"","data":[...]}` envelope of every REST response
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

impl<T> Envelope<T> {
    /// Turn a non-zero envelope code into a typed error
    pub fn into_result(self) -> Result<Vec<T>> {
        if self.code == "0" {
            Ok(self.data)
        } else {
            Err(BotError::from_exchange_code(&self.code, &self.msg))
        }
    }
}

/// Per-item acknowledgement of order placement and cancellation
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAck {
    #[serde(default)]
    pub ord_id: String,
    #[serde(default)]
    pub cl_ord_id: String,
    #[serde(default)]
    pub s_code: String,
    #[serde(default)]
    pub s_msg: String,
}

impl RawAck {
    pub fn check(&self) -> Result<()> {
        if self.s_code.is_empty() || self.s_code == "0" {
            Ok(())
        } else {
            Err(BotError::from_exchange_code(&self.s_code, &self.s_msg))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOrder {
    pub inst_id: String,
    pub ord_id: String,
    #[serde(default)]
    pub cl_ord_id: String,
    pub side: String,
    #[serde(default)]
    pub pos_side: String,
    #[serde(default)]
    pub ord_type: String,
    #[serde(default)]
    pub sz: String,
    #[serde(default)]
    pub px: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub acc_fill_sz: String,
    #[serde(default)]
    pub avg_px: String,
    #[serde(default)]
    pub fee: String,
    #[serde(default)]
    pub trade_id: String,
    #[serde(default)]
    pub u_time: String,
}

impl RawOrder {
    pub fn into_report(self) -> Result<OrderReport> {
        if self.ord_id.is_empty() {
            return Err(BotError::MalformedMessage("order record without ordId".into()));
        }
        let side = parse_side(&self.side)?;
        let order_type = OrderType::parse(&self.ord_type).unwrap_or(OrderType::Limit);

        Ok(OrderReport {
            order_id: self.ord_id,
            client_order_id: non_empty(self.cl_ord_id),
            symbol: self.inst_id,
            side,
            pos_side: parse_pos_side(&self.pos_side),
            order_type,
            amount: required_num("sz", &self.sz)?,
            price: parse_opt_num(&self.px),
            status: OrderStatus::from_exchange_state(&self.state),
            filled_amount: match self.acc_fill_sz.as_str() {
                "" => 0.0,
                raw => required_num("accFillSz", raw)?,
            },
            avg_price: parse_opt_num(&self.avg_px).filter(|p| *p > 0.0),
            // Exchange reports fees as negative numbers when charged
            fee: -parse_num(&self.fee),
            trade_id: non_empty(self.trade_id),
            updated_at: parse_millis(&self.u_time),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPosition {
    pub inst_id: String,
    #[serde(default)]
    pub pos_side: String,
    pub pos: String,
    #[serde(default)]
    pub avg_px: String,
    #[serde(default)]
    pub lever: String,
    #[serde(default)]
    pub upl: String,
    #[serde(default)]
    pub realized_pnl: String,
    #[serde(default)]
    pub mark_px: String,
    #[serde(default)]
    pub u_time: String,
}

impl RawPosition {
    pub fn into_snapshot(self) -> Result<PositionSnapshot> {
        if self.inst_id.is_empty() {
            return Err(BotError::MalformedMessage("position record without instId".into()));
        }
        // Main and hedge legs coexist, so only long/short position mode is tracked
        let side = parse_pos_side(&self.pos_side).ok_or_else(|| {
            BotError::MalformedMessage(format!(
                "position {} without long/short posSide ({:?})",
                self.inst_id, self.pos_side
            ))
        })?;
        let pos = required_num("pos", &self.pos)?;

        Ok(PositionSnapshot {
            symbol: self.inst_id,
            side,
            size: pos.abs(),
            entry_price: parse_num(&self.avg_px),
            leverage: parse_opt_num(&self.lever).unwrap_or(1.0),
            unrealized_pnl: parse_num(&self.upl),
            realized_pnl: parse_num(&self.realized_pnl),
            mark_price: parse_opt_num(&self.mark_px),
            updated_at: parse_millis(&self.u_time),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTicker {
    pub inst_id: String,
    pub last: String,
    #[serde(default)]
    pub ts: String,
}

impl RawTicker {
    pub fn into_ticker(self) -> Result<Ticker> {
        let last = parse_opt_num(&self.last)
            .ok_or_else(|| BotError::MalformedMessage(format!("bad last price {:?}", self.last)))?;
        Ok(Ticker {
            symbol: self.inst_id,
            last,
            timestamp: parse_millis(&self.ts),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBalance {
    #[serde(default)]
    pub details: Vec<RawBalanceDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBalanceDetail {
    pub ccy: String,
    #[serde(default)]
    pub eq: String,
    #[serde(default)]
    pub avail_bal: String,
}

impl From<RawBalanceDetail> for Balance {
    fn from(raw: RawBalanceDetail) -> Self {
        Balance {
            currency: raw.ccy,
            equity: parse_num(&raw.eq),
            available: parse_num(&raw.avail_bal),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInstrument {
    pub inst_id: String,
    #[serde(default)]
    pub tick_sz: String,
    #[serde(default)]
    pub lot_sz: String,
    #[serde(default)]
    pub min_sz: String,
    #[serde(default)]
    pub ct_val: String,
}

impl From<RawInstrument> for InstrumentInfo {
    fn from(raw: RawInstrument) -> Self {
        InstrumentInfo {
            symbol: raw.inst_id,
            tick_size: parse_num(&raw.tick_sz),
            lot_size: parse_num(&raw.lot_sz),
            min_size: parse_num(&raw.min_sz),
            contract_value: parse_opt_num(&raw.ct_val).unwrap_or(1.0),
        }
    }
}

/// Candles arrive as `[ts, o, h, l, c, vol, ...]` string arrays
pub fn parse_candle(symbol: &str, row: &[String]) -> Result<Candle> {
    if row.len() < 6 {
        return Err(BotError::MalformedMessage(format!(
            "candle row has {} fields",
            row.len()
        )));
    }
    Ok(Candle {
        symbol: symbol.to_string(),
        timestamp: parse_millis(&row[0]),
        open: parse_num(&row[1]),
        high: parse_num(&row[2]),
        low: parse_num(&row[3]),
        close: parse_num(&row[4]),
        volume: parse_num(&row[5]),
    })
}

pub fn parse_side(raw: &str) -> Result<Side> {
    match raw {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        other => Err(BotError::MalformedMessage(format!("unknown side {:?}", other))),
    }
}

pub fn parse_pos_side(raw: &str) -> Option<PositionSide> {
    match raw {
        "long" => Some(PositionSide::Long),
        "short" => Some(PositionSide::Short),
        _ => None,
    }
}

/// Decimal string to f64, empty or garbage reads as zero
pub fn parse_num(raw: &str) -> f64 {
    raw.parse::<f64>().unwrap_or(0.0)
}

/// Field that decides state transitions; anything unparseable rejects the record
fn required_num(field: &str, raw: &str) -> Result<f64> {
    parse_opt_num(raw)
        .ok_or_else(|| BotError::MalformedMessage(format!("bad {} {:?}", field, raw)))
}

pub fn parse_opt_num(raw: &str) -> Option<f64> {
    if raw.is_empty() {
        None
    } else {
        raw.parse::<f64>().ok()
    }
}

/// Millisecond epoch string to timestamp; missing values read as now
pub fn parse_millis(raw: &str) -> DateTime<Utc> {
    raw.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

/// Format a quantity or price the way the exchange expects (no exponent, no trailing zeros)
pub fn format_num(value: f64) -> String {
    let formatted = format!("{:.8}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

fn non_empty(raw: String) -> Option<String> {
    if raw.is_empty() {
        None
    } else {
        Some(raw)
    }
}
