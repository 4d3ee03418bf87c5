//! Fan-out of `messages_appended` notifications to the work queue (C3).
//!
//! The wire-level transport (Postgres `LISTEN`/`NOTIFY`, or an
//! in-process callback for single-process backends) is a narrow
//! interface implemented by each backend crate; this module owns the
//! reactor-interest bookkeeping and the reconnect/backoff policy that
//! is common to all of them, keeping transport and policy separate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::work_queue::WorkQueue;

/// Narrow interface a backend implements to let the `Notifier` listen
/// for newly appended message types. `listen_once` should block until
/// either a notification arrives or `timeout` elapses, returning the
/// comma-separated set of message types that were appended.
#[async_trait::async_trait]
pub trait NotificationSource: Send + Sync {
    async fn listen_once(&self, timeout: Duration) -> NotifyResult;
}

/// Outcome of one `listen_once` call.
pub enum NotifyResult {
    /// New messages of these types were appended.
    Types(Vec<String>),
    /// Nothing happened before the timeout; try again.
    Timeout,
    /// The underlying connection was lost; the `Notifier` will
    /// reconnect with linear backoff (§4.3).
    Disconnected(String),
}

/// Maps message type -> interested reactor names, and pushes each
/// interested reactor onto the [`WorkQueue`] when a notification names
/// one of its handled types.
pub struct Notifier {
    source: Arc<dyn NotificationSource>,
    queue: Arc<WorkQueue>,
    interest: HashMap<String, Vec<String>>,
    max_consecutive_failures: u32,
    backoff_step: Duration,
    backoff_cap: Duration,
}

impl Notifier {
    pub fn new(source: Arc<dyn NotificationSource>, queue: Arc<WorkQueue>) -> Self {
        Self {
            source,
            queue,
            interest: HashMap::new(),
            max_consecutive_failures: 10,
            backoff_step: Duration::from_millis(200),
            backoff_cap: Duration::from_secs(5),
        }
    }

    /// Register `reactor_name` as interested in `handled_messages`.
    /// Called once per reactor at Supervisor startup, building the
    /// eager `type -> [reactor]` map (§4.3).
    pub fn register(&mut self, reactor_name: &str, handled_messages: &[String]) {
        for t in handled_messages {
            self.interest
                .entry(t.clone())
                .or_default()
                .push(reactor_name.to_string());
        }
    }

    /// Compute the unique set of reactors interested in any of `types`.
    /// Unknown types are ignored (§4.3).
    fn interested_reactors(&self, types: &[String]) -> HashSet<String> {
        let mut out = HashSet::new();
        for t in types {
            if let Some(reactors) = self.interest.get(t) {
                out.extend(reactors.iter().cloned());
            }
        }
        out
    }

    /// Run the listen loop until `running` observes shutdown. Exits
    /// with an error only after `max_consecutive_failures` reconnect
    /// attempts in a row have failed (§4.3, §5 Cancellation).
    pub async fn run(&self, running: Arc<std::sync::atomic::AtomicBool>) -> Result<(), String> {
        let mut consecutive_failures: u32 = 0;

        while running.load(std::sync::atomic::Ordering::Relaxed) {
            match self.source.listen_once(Duration::from_secs(5)).await {
                NotifyResult::Types(types) => {
                    consecutive_failures = 0;
                    let reactors = self.interested_reactors(&types);
                    for r in &reactors {
                        self.queue.push(r);
                    }
                    debug!(?types, n_reactors = reactors.len(), "messages_appended fan-out");
                }
                NotifyResult::Timeout => {
                    consecutive_failures = 0;
                }
                NotifyResult::Disconnected(reason) => {
                    consecutive_failures += 1;
                    warn!(
                        attempt = consecutive_failures,
                        %reason,
                        "notifier disconnected, reconnecting"
                    );
                    if consecutive_failures >= self.max_consecutive_failures {
                        error!("notifier exceeded max reconnect attempts, giving up");
                        return Err(reason);
                    }
                    let delay = (self.backoff_step * consecutive_failures).min(self.backoff_cap);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Ok(())
    }
}
