//! HMAC-SHA256 request signing.
//!
//! REST and WebSocket login share one scheme:
//! `base64(HMAC_SHA256(secret, timestamp + method + path + body))`.
//! The WebSocket login always signs `GET /users/self/verify` with an empty body.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Path signed by the streaming login frame
pub const WS_LOGIN_PATH: &str = "/users/self/verify";

/// Sign an arbitrary prehash string with the account secret.
pub fn sign(secret: &str, prehash: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(prehash.as_bytes());
    BASE64_STANDARD.encode(mac.finalize().into_bytes())
}

/// Build the REST prehash string.
///
/// `body` must be empty for GET/DELETE and the compact JSON body for POST/PUT.
pub fn rest_prehash(timestamp: &str, method: &str, path: &str, body: &str) -> String {
    format!("{}{}{}{}", timestamp, method.to_uppercase(), path, body)
}

/// Signature for one REST request
pub fn sign_rest(secret: &str, timestamp: &str, method: &str, path: &str, body: &str) -> String {
    sign(secret, &rest_prehash(timestamp, method, path, body))
}

/// Signature for the streaming login frame
pub fn sign_ws_login(secret: &str, timestamp: &str) -> String {
    sign(secret, &rest_prehash(timestamp, "GET", WS_LOGIN_PATH, ""))
}

/// ISO-8601 millisecond timestamp used by REST headers (`2020-12-08T09:08:57.715Z`)
pub fn rest_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Unix seconds timestamp used by the streaming login frame
pub fn ws_timestamp(now: DateTime<Utc>) -> String {
    now.timestamp().to_string()
}
