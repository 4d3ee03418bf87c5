//! Periodic safety-net pusher (C5).
//!
//! Covers startup, missed notifications, a dropped pubsub connection,
//! non-Postgres backends, and offset resets — cheap because
//! [`WorkQueue::push`](crate::work_queue::WorkQueue::push) silently
//! drops anything already at cap (§4.5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::work_queue::WorkQueue;

pub struct CatchUpPoller {
    queue: Arc<WorkQueue>,
    reactor_names: Vec<String>,
    interval: Duration,
}

impl CatchUpPoller {
    pub fn new(queue: Arc<WorkQueue>, reactor_names: Vec<String>, interval: Duration) -> Self {
        Self {
            queue,
            reactor_names,
            interval,
        }
    }

    /// Push every registered reactor every `interval`, until `running`
    /// is cleared.
    pub async fn run(&self, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            for name in &self.reactor_names {
                self.queue.push(name);
            }
            debug!(n = self.reactor_names.len(), "catch-up poll pushed reactors");
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pushes_every_registered_reactor() {
        let queue = Arc::new(WorkQueue::new(4));
        let poller = CatchUpPoller::new(
            queue.clone(),
            vec!["a".to_string(), "b".to_string()],
            Duration::from_millis(10),
        );
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();
        let handle = tokio::spawn(async move {
            poller.run(running_clone).await;
        });

        tokio::time::sleep(Duration::from_millis(15)).await;
        running.store(false, Ordering::Relaxed);
        let _ = handle.await;

        let mut seen = std::collections::HashSet::new();
        for _ in 0..2 {
            if let Some(name) = queue.pop().await {
                seen.insert(name);
            }
        }
        assert!(seen.contains("a"));
        assert!(seen.contains("b"));
    }
}
