use crate::error::BotError;
use chrono::{DateTime, Duration, Utc};

/// Why new entries are blocked on a symbol
#[derive(Debug, Clone, PartialEq)]
pub enum EntryTrip {
    InsufficientBalance(String),
    RiskLimit(String),
}

impl EntryTrip {
    /// The trip an exchange error causes, if any
    pub fn from_error(error: &BotError) -> Option<Self> {
        match error {
            BotError::InsufficientBalance(msg) => Some(Self::InsufficientBalance(msg.clone())),
            BotError::RiskLimitExceeded(msg) => Some(Self::RiskLimit(msg.clone())),
            _ => None,
        }
    }
}

/// Per-symbol breaker that stops new entries after a balance or risk-limit
/// rejection. Exits are never blocked.
///
/// The breaker resets after `cooldown`, or earlier when the exchange reports a
/// position change that frees margin (see [`EntryBreaker::reset`]).
#[derive(Debug, Clone)]
pub struct EntryBreaker {
    cooldown: Duration,
    trip: Option<(EntryTrip, DateTime<Utc>)>,
}

impl EntryBreaker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            trip: None,
        }
    }

    pub fn trip(&mut self, reason: EntryTrip, now: DateTime<Utc>) {
        tracing::warn!("🛑 Entries blocked until {}: {:?}", now + self.cooldown, reason);
        self.trip = Some((reason, now));
    }

    /// Ok when entries are allowed at `now`
    pub fn check(&mut self, now: DateTime<Utc>) -> Result<(), EntryTrip> {
        match self.trip {
            Some((ref reason, at)) if now - at < self.cooldown => Err(reason.clone()),
            Some(_) => {
                tracing::info!("Entry block expired");
                self.trip = None;
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.trip.is_some()
    }

    pub fn reset(&mut self) {
        self.trip = None;
    }
}

impl Default for EntryBreaker {
    fn default() -> Self {
        Self::new(Duration::minutes(15))
    }
}
