//! Pops reactor names off the WorkQueue and drains them (C8, §4.8).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error_strategy::ErrorStrategy;
use crate::reactor::Reactor;
use crate::router::Router;
use crate::work_queue::WorkQueue;

pub struct Worker {
    pub id: String,
    router: Arc<Router>,
    queue: Arc<WorkQueue>,
    reactors: Arc<HashMap<String, Arc<dyn Reactor>>>,
    error_strategy: Arc<dyn ErrorStrategy>,
    batch_size: usize,
    max_drain_rounds: usize,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        router: Arc<Router>,
        queue: Arc<WorkQueue>,
        reactors: Arc<HashMap<String, Arc<dyn Reactor>>>,
        error_strategy: Arc<dyn ErrorStrategy>,
        batch_size: usize,
        max_drain_rounds: usize,
    ) -> Self {
        Self {
            id: id.into(),
            router,
            queue,
            reactors,
            error_strategy,
            batch_size,
            max_drain_rounds,
        }
    }

    /// `pop -> drain` loop until the shutdown sentinel (`None`) arrives.
    pub async fn run(&self, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            match self.queue.pop().await {
                None => break,
                Some(reactor_name) => {
                    self.drain(&reactor_name, &running).await;
                }
            }
        }
        debug!(worker_id = %self.id, "worker stopped");
    }

    /// Keep calling the Router for `reactor_name` while it keeps making
    /// progress, bounded by `max_drain_rounds`; re-push on hitting the
    /// bound so other reactors get serviced too (§4.8).
    async fn drain(&self, reactor_name: &str, running: &Arc<AtomicBool>) {
        let Some(reactor) = self.reactors.get(reactor_name) else {
            warn!(reactor_name, "no reactor registered under this name");
            return;
        };

        let mut rounds = 0usize;
        let mut backoff_attempts = 0u32;

        while running.load(Ordering::Relaxed) && rounds < self.max_drain_rounds {
            let result = self
                .router
                .handle_next_event_for_reactor(
                    reactor.as_ref(),
                    &self.id,
                    self.batch_size,
                    self.error_strategy.as_ref(),
                )
                .await;

            match result {
                Ok(true) => {
                    rounds += 1;
                    backoff_attempts = 0;
                }
                Ok(false) => break,
                Err(_) => {
                    // A handler error was already routed through
                    // ErrorStrategy inside the Router; here we only
                    // guard against a hot loop on a backend that keeps
                    // disconnecting (transient backend disconnect,
                    // §4.8: linear backoff up to N attempts).
                    backoff_attempts += 1;
                    if backoff_attempts >= 5 {
                        warn!(reactor_name, "giving up on reactor after repeated errors");
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100 * backoff_attempts as u64)).await;
                }
            }
        }

        if rounds == self.max_drain_rounds {
            self.queue.push(reactor_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::{Backend, StartFrom};
    use crate::error_strategy::DefaultErrorStrategy;
    use crate::reactor::{ConsumerInfo, ReactorFamily};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingReactor {
        name: String,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Reactor for CountingReactor {
        fn name(&self) -> &str {
            &self.name
        }

        fn family(&self) -> ReactorFamily {
            ReactorFamily::Projector
        }

        fn handled_messages(&self) -> Vec<String> {
            vec!["demo.Thing".to_string()]
        }

        fn consumer_info(&self) -> ConsumerInfo {
            ConsumerInfo::new(self.name.clone(), StartFrom::Beginning)
        }

        async fn handle_batch(
            &self,
            batch: Vec<crate::message::BatchEntry>,
            _history: Option<Vec<crate::message::Message>>,
        ) -> crate::errors::CoreResult<Vec<crate::actions::ActionPair>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(batch
                .into_iter()
                .map(|entry| crate::actions::ActionPair::ack_only(entry.message))
                .collect())
        }
    }

    #[tokio::test]
    async fn drain_stops_once_no_more_work() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        backend.install().await.unwrap();
        let msg = crate::message::Message::new("s1", "demo.Thing", serde_json::json!({}));
        backend.append_next_to_stream("s1", vec![msg]).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let reactor: Arc<dyn Reactor> = Arc::new(CountingReactor {
            name: "counter".into(),
            calls: calls.clone(),
        });
        let mut reactors = HashMap::new();
        reactors.insert("counter".to_string(), reactor);

        let router = Arc::new(Router::new(backend));
        let queue = Arc::new(WorkQueue::new(4));
        let worker = Worker::new(
            "w1",
            router,
            queue.clone(),
            Arc::new(reactors),
            Arc::new(DefaultErrorStrategy::default()),
            10,
            25,
        );

        let running = Arc::new(AtomicBool::new(true));
        worker.drain("counter", &running).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
