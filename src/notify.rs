//! User-facing notifications.
//!
//! Delivery is fire-and-forget: a notifier must never block or fail the
//! trading path. Implementations that talk to a network spawn their own work.

use std::sync::Mutex;

pub trait Notifier: Send + Sync {
    fn notify(&self, user_id: &str, message: &str);
}

/// Writes notifications to the log
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, user_id: &str, message: &str) {
        tracing::warn!(user = %user_id, "🔔 {}", message);
    }
}

/// Keeps notifications in memory, for dry runs and tests
#[derive(Default)]
pub struct MemoryNotifier {
    messages: Mutex<Vec<(String, String)>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, user_id: &str, message: &str) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((user_id.to_string(), message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_notifier_keeps_order() {
        let notifier = MemoryNotifier::new();
        notifier.notify("u1", "first");
        notifier.notify("u2", "second");

        let messages = notifier.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], ("u1".to_string(), "first".to_string()));
    }
}
