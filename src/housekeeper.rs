//! Scheduled-message promotion, heartbeats, stale-claim reaping (C9, §4.9).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::backend::Backend;

pub struct HouseKeeper {
    backend: Arc<dyn Backend>,
    interval: Duration,
    heartbeat_interval: Duration,
    claim_ttl_seconds: i64,
    worker_ids: Vec<String>,
}

impl HouseKeeper {
    pub fn new(
        backend: Arc<dyn Backend>,
        interval: Duration,
        heartbeat_interval: Duration,
        claim_ttl_seconds: i64,
        worker_ids: Vec<String>,
    ) -> Self {
        Self {
            backend,
            interval,
            heartbeat_interval,
            claim_ttl_seconds,
            worker_ids,
        }
    }

    /// Every `interval`: promote due scheduled messages, heartbeat (at
    /// `heartbeat_interval` granularity), and reap stale claims.
    /// Multiple housekeepers stagger themselves with a small random
    /// startup delay so they don't all tick in lockstep (§4.9).
    pub async fn run(&self, running: Arc<AtomicBool>) {
        let jitter_ms = rand::thread_rng().gen_range(0..250);
        tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

        let mut last_heartbeat = tokio::time::Instant::now() - self.heartbeat_interval;

        while running.load(Ordering::Relaxed) {
            if let Err(e) = self.tick(&mut last_heartbeat).await {
                warn!(error = %e, "housekeeper tick failed");
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    async fn tick(&self, last_heartbeat: &mut tokio::time::Instant) -> Result<(), crate::errors::CoreError> {
        let promoted = self.backend.update_schedule().await?;
        if promoted > 0 {
            debug!(promoted, "housekeeper promoted scheduled messages");
        }

        if last_heartbeat.elapsed() >= self.heartbeat_interval {
            self.backend.worker_heartbeat(&self.worker_ids).await?;
            *last_heartbeat = tokio::time::Instant::now();
        }

        let reaped = self.backend.release_stale_claims(self.claim_ttl_seconds).await?;
        if reaped > 0 {
            debug!(reaped, "housekeeper released stale claims");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    #[tokio::test]
    async fn tick_promotes_schedule_and_heartbeats() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        backend.install().await.unwrap();

        let past = chrono::Utc::now() - chrono::Duration::seconds(5);
        let msg = crate::message::Message::new("s1", "demo.Thing", serde_json::json!({}));
        backend.schedule_messages(vec![msg], past).await.unwrap();

        let hk = HouseKeeper::new(
            backend.clone(),
            Duration::from_secs(1),
            Duration::from_secs(1),
            60,
            vec!["w1".to_string()],
        );
        let mut last_heartbeat = tokio::time::Instant::now() - Duration::from_secs(10);
        hk.tick(&mut last_heartbeat).await.unwrap();

        let stream = backend.read_stream("s1", None).await.unwrap();
        assert_eq!(stream.len(), 1);
    }
}
