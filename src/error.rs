use thiserror::Error;

/// Every failure the bot can surface, grouped by how it must be handled.
///
/// Connection-level errors (`Authentication`, `TransientNetwork`,
/// `ConnectionClosed`) are recovered by the feed's reconnect cycle.
/// Business errors (`OrderRejected`, `InsufficientBalance`,
/// `RiskLimitExceeded`) go back to the caller and are never retried.
#[derive(Debug, Error)]
pub enum BotError {
    /// Login rejected. The socket is unusable and must be rebuilt.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("order rejected ({code}): {message}")]
    OrderRejected { code: String, message: String },

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("risk limit exceeded: {0}")]
    RiskLimitExceeded(String),

    #[error("reconciliation drift: {0}")]
    ReconciliationDrift(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("shared store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BotError {
    /// Errors worth another attempt after a backoff delay.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::ConnectionClosed)
    }

    /// Errors that invalidate the current socket.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }

    /// Errors that block further entries on the symbol until resolved.
    pub fn blocks_entries(&self) -> bool {
        matches!(
            self,
            Self::InsufficientBalance(_) | Self::RiskLimitExceeded(_)
        )
    }

    /// Map an exchange business code (`sCode` / `code`) onto the taxonomy.
    pub fn from_exchange_code(code: &str, message: &str) -> Self {
        match code {
            "51008" | "51020" | "51119" | "51127" | "51131" => {
                Self::InsufficientBalance(message.to_string())
            }
            "51004" | "51120" | "51121" | "51202" | "51205" => {
                Self::RiskLimitExceeded(message.to_string())
            }
            "50011" | "50013" | "50026" => Self::TransientNetwork(format!("{code}: {message}")),
            "50111" | "50113" | "50104" => Self::Authentication(message.to_string()),
            "51603" => Self::NotFound(message.to_string()),
            _ => Self::OrderRejected {
                code: code.to_string(),
                message: message.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for BotError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::MalformedMessage(e.to_string())
        } else {
            Self::TransientNetwork(e.to_string())
        }
    }
}

impl From<serde_json::Error> for BotError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedMessage(e.to_string())
    }
}

impl From<redis::RedisError> for BotError {
    fn from(e: redis::RedisError) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<config::ConfigError> for BotError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BotError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::ConnectionClosed,
            other => Self::TransientNetwork(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_codes_block_entries() {
        let err = BotError::from_exchange_code("51008", "Insufficient margin");
        assert!(matches!(err, BotError::InsufficientBalance(_)));
        assert!(err.blocks_entries());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_risk_limit_codes() {
        let err = BotError::from_exchange_code("51004", "exceeds tier limit");
        assert!(matches!(err, BotError::RiskLimitExceeded(_)));
        assert!(err.blocks_entries());
    }

    #[test]
    fn test_unknown_code_is_rejection() {
        let err = BotError::from_exchange_code("51000", "Parameter sz error");
        match err {
            BotError::OrderRejected { code, message } => {
                assert_eq!(code, "51000");
                assert_eq!(message, "Parameter sz error");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rate_limit_is_retryable() {
        assert!(BotError::from_exchange_code("50011", "Too many requests").is_retryable());
        assert!(BotError::ConnectionClosed.is_retryable());
        assert!(!BotError::Authentication("bad sign".into()).is_retryable());
        assert!(BotError::Authentication("bad sign".into()).is_fatal_for_connection());
    }
}
