//! Single `Config` value, built once and passed explicitly to
//! `Supervisor`/`Router` (SPEC_FULL.md §10.3; DESIGN NOTES: "Global
//! configuration singleton" re-cast this way).

use std::sync::Arc;
use std::time::Duration;

use crate::error_strategy::{DefaultErrorStrategy, ErrorStrategy};

/// Which concurrency runtime drives the Supervisor's tasks (§6
/// `executor`). Both variants run on the caller's async runtime;
/// `Cooperative` caps worker concurrency at 1 in-process task sharing
/// a single OS thread's worth of work, `Parallel` spawns each worker as
/// its own `tokio::task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Executor {
    Parallel,
    Cooperative,
}

/// Recognized configuration surface (§6).
pub struct Config {
    pub worker_count: usize,
    pub worker_batch_size: usize,
    pub housekeeping_interval: Duration,
    pub housekeeping_heartbeat_interval: Duration,
    pub housekeeping_claim_ttl_seconds: i64,
    pub catch_up_interval: Duration,
    pub work_queue_max_per_reactor: usize,
    pub error_strategy: Arc<dyn ErrorStrategy>,
    pub executor: Executor,
    pub max_drain_rounds: usize,
}

impl Default for Config {
    fn default() -> Self {
        let worker_count = 2;
        Self {
            worker_count,
            worker_batch_size: 1,
            housekeeping_interval: Duration::from_secs(3),
            housekeeping_heartbeat_interval: Duration::from_secs(5),
            housekeeping_claim_ttl_seconds: 120,
            catch_up_interval: Duration::from_secs(5),
            work_queue_max_per_reactor: worker_count,
            error_strategy: Arc::new(DefaultErrorStrategy::default()),
            executor: Executor::Parallel,
            max_drain_rounds: 25,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Explicit builder for [`Config`], since it carries a trait object
/// field that can't derive `Clone`/struct-update ergonomically.
#[derive(Default)]
pub struct ConfigBuilder {
    inner: PartialConfig,
}

#[derive(Default)]
struct PartialConfig {
    worker_count: Option<usize>,
    worker_batch_size: Option<usize>,
    housekeeping_interval: Option<Duration>,
    housekeeping_heartbeat_interval: Option<Duration>,
    housekeeping_claim_ttl_seconds: Option<i64>,
    catch_up_interval: Option<Duration>,
    work_queue_max_per_reactor: Option<usize>,
    error_strategy: Option<Arc<dyn ErrorStrategy>>,
    executor: Option<Executor>,
    max_drain_rounds: Option<usize>,
}

impl ConfigBuilder {
    pub fn worker_count(mut self, n: usize) -> Self {
        self.inner.worker_count = Some(n);
        self
    }

    pub fn worker_batch_size(mut self, n: usize) -> Self {
        self.inner.worker_batch_size = Some(n);
        self
    }

    pub fn housekeeping_interval(mut self, d: Duration) -> Self {
        self.inner.housekeeping_interval = Some(d);
        self
    }

    pub fn housekeeping_heartbeat_interval(mut self, d: Duration) -> Self {
        self.inner.housekeeping_heartbeat_interval = Some(d);
        self
    }

    pub fn housekeeping_claim_ttl_seconds(mut self, s: i64) -> Self {
        self.inner.housekeeping_claim_ttl_seconds = Some(s);
        self
    }

    pub fn catch_up_interval(mut self, d: Duration) -> Self {
        self.inner.catch_up_interval = Some(d);
        self
    }

    pub fn work_queue_max_per_reactor(mut self, n: usize) -> Self {
        self.inner.work_queue_max_per_reactor = Some(n);
        self
    }

    pub fn error_strategy(mut self, strategy: Arc<dyn ErrorStrategy>) -> Self {
        self.inner.error_strategy = Some(strategy);
        self
    }

    pub fn executor(mut self, executor: Executor) -> Self {
        self.inner.executor = Some(executor);
        self
    }

    pub fn max_drain_rounds(mut self, n: usize) -> Self {
        self.inner.max_drain_rounds = Some(n);
        self
    }

    pub fn build(self) -> Config {
        let defaults = Config::default();
        let worker_count = self.inner.worker_count.unwrap_or(defaults.worker_count);
        Config {
            worker_count,
            worker_batch_size: self.inner.worker_batch_size.unwrap_or(defaults.worker_batch_size),
            housekeeping_interval: self
                .inner
                .housekeeping_interval
                .unwrap_or(defaults.housekeeping_interval),
            housekeeping_heartbeat_interval: self
                .inner
                .housekeeping_heartbeat_interval
                .unwrap_or(defaults.housekeeping_heartbeat_interval),
            housekeeping_claim_ttl_seconds: self
                .inner
                .housekeeping_claim_ttl_seconds
                .unwrap_or(defaults.housekeeping_claim_ttl_seconds),
            catch_up_interval: self.inner.catch_up_interval.unwrap_or(defaults.catch_up_interval),
            work_queue_max_per_reactor: self
                .inner
                .work_queue_max_per_reactor
                .unwrap_or(worker_count),
            error_strategy: self.inner.error_strategy.unwrap_or(defaults.error_strategy),
            executor: self.inner.executor.unwrap_or(defaults.executor),
            max_drain_rounds: self.inner.max_drain_rounds.unwrap_or(defaults.max_drain_rounds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_work_queue_cap_matches_worker_count() {
        let config = Config::default();
        assert_eq!(config.work_queue_max_per_reactor, config.worker_count);
    }

    #[test]
    fn builder_overrides_individual_fields() {
        let config = Config::builder().worker_count(8).worker_batch_size(4).build();
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.worker_batch_size, 4);
        // unset work_queue cap follows the overridden worker_count, not the default 2.
        assert_eq!(config.work_queue_max_per_reactor, 8);
    }
}
