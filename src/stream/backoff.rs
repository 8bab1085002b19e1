use rand::Rng;
use std::time::Duration;

/// Bounded exponential reconnect delay with symmetric jitter.
///
/// After `max_attempts` consecutive failures the policy gives up and the
/// feed task ends; a supervisor is expected to start a fresh one.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    /// Fraction of the delay added or removed at random, 0.0..=1.0
    jitter: f64,
    max_attempts: u32,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or None once the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }

        let base = self.base_delay(self.attempt);
        self.attempt += 1;

        if self.jitter == 0.0 {
            return Some(base);
        }
        let spread = base.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Some(Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0)))
    }

    /// Un-jittered delay for a given attempt number
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Called after a successful login
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            2.0,
            0.2,
            10,
        )
    }
}
