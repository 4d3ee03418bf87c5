//! Orchestrates workers, notifier, poller and housekeeper(s) (C10, §4.10).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::backend::Backend;
use crate::catch_up_poller::CatchUpPoller;
use crate::config::Config;
use crate::housekeeper::HouseKeeper;
use crate::notifier::{NotificationSource, Notifier};
use crate::reactor::Reactor;
use crate::router::Router;
use crate::work_queue::WorkQueue;
use crate::worker::Worker;

/// Owns every long-lived task the runtime spawns and the shared
/// `running` flag cancellation observes (§5).
pub struct Supervisor {
    config: Config,
    backend: Arc<dyn Backend>,
    notification_source: Option<Arc<dyn NotificationSource>>,
    reactors: HashMap<String, Arc<dyn Reactor>>,
    running: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(config: Config, backend: Arc<dyn Backend>) -> Self {
        Self {
            config,
            backend,
            notification_source: None,
            reactors: HashMap::new(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_notification_source(mut self, source: Arc<dyn NotificationSource>) -> Self {
        self.notification_source = Some(source);
        self
    }

    pub fn register_reactor(&mut self, reactor: Arc<dyn Reactor>) {
        self.reactors.insert(reactor.name().to_string(), reactor);
    }

    /// Spawn every task concurrently and return a [`SupervisorHandle`]
    /// the caller uses to wait for shutdown completion.
    pub async fn start(self) -> SupervisorHandle {
        self.running.store(true, Ordering::Relaxed);

        let queue = Arc::new(WorkQueue::new(self.config.work_queue_max_per_reactor));
        let router = Arc::new(Router::new(self.backend.clone()));
        let reactors = Arc::new(self.reactors);

        let mut handles = Vec::new();

        // Workers.
        for i in 0..self.config.worker_count {
            let worker = Worker::new(
                format!("worker-{i}"),
                router.clone(),
                queue.clone(),
                reactors.clone(),
                self.config.error_strategy.clone(),
                self.config.worker_batch_size,
                self.config.max_drain_rounds,
            );
            let running = self.running.clone();
            handles.push(tokio::spawn(async move {
                worker.run(running).await;
            }));
        }

        // Catch-up poller.
        let reactor_names: Vec<String> = reactors.keys().cloned().collect();
        let poller = CatchUpPoller::new(queue.clone(), reactor_names.clone(), self.config.catch_up_interval);
        let running = self.running.clone();
        handles.push(tokio::spawn(async move {
            poller.run(running).await;
        }));

        // Housekeeper.
        let worker_ids: Vec<String> = (0..self.config.worker_count).map(|i| format!("worker-{i}")).collect();
        let housekeeper = HouseKeeper::new(
            self.backend.clone(),
            self.config.housekeeping_interval,
            self.config.housekeeping_heartbeat_interval,
            self.config.housekeeping_claim_ttl_seconds,
            worker_ids,
        );
        let running = self.running.clone();
        handles.push(tokio::spawn(async move {
            housekeeper.run(running).await;
        }));

        // Notifier (optional: in-process backends may push straight
        // onto the queue via their own callback instead).
        if let Some(source) = self.notification_source {
            let mut notifier = Notifier::new(source, queue.clone());
            for (name, reactor) in reactors.iter() {
                notifier.register(name, &reactor.handled_messages());
            }
            let running = self.running.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = notifier.run(running).await {
                    tracing::error!(error = %e, "notifier task exited with error");
                }
            }));
        }

        info!(
            worker_count = self.config.worker_count,
            n_reactors = reactor_names.len(),
            "supervisor started"
        );

        SupervisorHandle {
            running: self.running,
            queue,
            worker_count: self.config.worker_count,
            handles,
        }
    }
}

pub struct SupervisorHandle {
    running: Arc<AtomicBool>,
    queue: Arc<WorkQueue>,
    worker_count: usize,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl SupervisorHandle {
    /// Signal `stop` to every component, close the work queue with
    /// sentinels, and wait for every task to finish (§4.10, §5
    /// Cancellation — triggered by SIGINT/SIGTERM at the call site).
    pub async fn shutdown(self) {
        self.running.store(false, Ordering::Relaxed);
        self.queue.close(self.worker_count);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("supervisor shut down");
    }

    /// Wait for `SIGINT` or `SIGTERM`, then shut down in place (§6
    /// "Shutdown signals").
    #[cfg(unix)]
    pub async fn run_until_signal(self) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }

        self.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    #[tokio::test]
    async fn start_and_shutdown_is_clean() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        backend.install().await.unwrap();

        let config = Config::builder().worker_count(2).build();
        let supervisor = Supervisor::new(config, backend);
        let handle = supervisor.start().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        handle.shutdown().await;
    }
}
