//! In-process stand-in for `LISTEN`/`NOTIFY`: SQLite has no pub/sub, so
//! [`crate::backend::SqliteBackend`] publishes appended types directly
//! onto a broadcast channel that this source reads from, rather than
//! polling the database (SPEC_FULL.md §10.3, §9 "Multiple backend
//! variants").

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use reactorcore::notifier::{NotificationSource, NotifyResult};

const CHANNEL_CAPACITY: usize = 1024;

/// Cloneable handle around a broadcast sender. Each subscriber gets its
/// own receiver, so a lagging notifier only drops its own backlog.
#[derive(Clone)]
pub struct NotifyBus {
    sender: broadcast::Sender<String>,
}

impl NotifyBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, message_type: String) {
        // No subscribers yet (or all lagging) is not an error: nobody is
        // listening for this append right now, and the catch-up poller
        // covers what a dropped notification would otherwise miss.
        let _ = self.sender.send(message_type);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}

impl Default for NotifyBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InProcessNotificationSource {
    receiver: tokio::sync::Mutex<broadcast::Receiver<String>>,
}

impl InProcessNotificationSource {
    pub fn new(bus: &NotifyBus) -> Self {
        Self {
            receiver: tokio::sync::Mutex::new(bus.subscribe()),
        }
    }
}

#[async_trait]
impl NotificationSource for InProcessNotificationSource {
    async fn listen_once(&self, timeout: Duration) -> NotifyResult {
        let mut receiver = self.receiver.lock().await;
        match tokio::time::timeout(timeout, receiver.recv()).await {
            Ok(Ok(message_type)) => NotifyResult::Types(vec![message_type]),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                // Missed some notifications; the catch-up poller will
                // pick up anything this drops.
                NotifyResult::Timeout
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                NotifyResult::Disconnected("notify bus closed".to_string())
            }
            Err(_) => NotifyResult::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_listen_once_returns_the_type() {
        let bus = NotifyBus::new();
        let source = InProcessNotificationSource::new(&bus);
        bus.publish("cart.ItemAdded".to_string());

        let result = source.listen_once(Duration::from_millis(100)).await;
        match result {
            NotifyResult::Types(types) => assert_eq!(types, vec!["cart.ItemAdded".to_string()]),
            _ => panic!("expected Types"),
        }
    }

    #[tokio::test]
    async fn listen_once_times_out_with_nothing_published() {
        let bus = NotifyBus::new();
        let source = InProcessNotificationSource::new(&bus);
        let result = source.listen_once(Duration::from_millis(20)).await;
        assert!(matches!(result, NotifyResult::Timeout));
    }
}
