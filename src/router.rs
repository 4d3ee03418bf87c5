//! Claim/dispatch core (C7, §4.7).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::actions::ExecuteAll;
use crate::backend::{Backend, ConsumerGroupInfo, GroupStatus, GroupUpdater};
use crate::error_strategy::{ErrorStrategy, GroupAction};
use crate::errors::{CoreError, CoreResult};
use crate::reactor::Reactor;

/// Simple struct implementing [`GroupUpdater`] by recording the
/// decision a closure made, which `Router` then asks the backend to
/// persist via `updating_consumer_group` (§4.2).
struct RecordingUpdater {
    decision: Option<GroupAction>,
}

impl GroupUpdater for RecordingUpdater {
    fn stop(&mut self, reason: String) {
        self.decision = Some(GroupAction::Stop {
            reason: reason.into(),
        });
    }

    fn retry(&mut self, at: chrono::DateTime<chrono::Utc>, error_context: serde_json::Value) {
        self.decision = Some(GroupAction::Retry { at, error_context });
    }
}

pub struct Router {
    backend: Arc<dyn Backend>,
}

impl Router {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Drive one unit of work for `reactor`: claim, handle, apply,
    /// ACK/retry/stop. Returns `true` if it actually made progress
    /// (used by the Worker's drain loop to decide whether to keep
    /// looping), `false` if there was no claimable work right now.
    pub async fn handle_next_event_for_reactor(
        &self,
        reactor: &dyn Reactor,
        worker_id: &str,
        batch_size: usize,
        error_strategy: &dyn ErrorStrategy,
    ) -> CoreResult<bool> {
        let info = reactor.consumer_info();
        self.backend
            .register_consumer_group(&info.group_id, info.start_from)
            .await?;

        // Step 1: stopped / in-backoff groups do no work and mutate
        // nothing (§8 "Stopped group idempotence").
        if self.group_is_unavailable(&info.group_id).await? {
            return Ok(false);
        }

        let handled_types = reactor.handled_messages();
        let batch_size = info.batch_size.unwrap_or(batch_size);

        // Steps 2-4: claim the earliest unclaimed offset with new work
        // and fetch the batch, atomically inside the backend.
        let claimed = self
            .backend
            .claim_next_batch(
                &info.group_id,
                &handled_types,
                batch_size,
                reactor.needs_history(),
                worker_id,
            )
            .await?;

        let Some(claimed) = claimed else {
            return Ok(false);
        };

        debug!(
            group_id = %info.group_id,
            stream_id = %claimed.offset.stream_id,
            batch_len = claimed.batch.len(),
            "claimed batch"
        );

        // Step 6: call the handler outside the claim-holding transaction.
        let last_global_seq = claimed
            .batch
            .iter()
            .filter_map(|entry| entry.message.global_seq)
            .max();
        let first_message = claimed
            .batch
            .first()
            .map(|entry| entry.message.clone())
            .unwrap_or_else(|| crate::message::Message::new(&claimed.offset.stream_id, "internal.EmptyBatch", json!({})));

        let handled = reactor.handle_batch(claimed.batch, claimed.history).await;

        match handled {
            Ok(pairs) => {
                // Step 7: apply every pair's actions, then ACK, inside one
                // transaction handle, so either all of it commits or none
                // of it does.
                let applied = Arc::new(AtomicUsize::new(0));
                let failing_message = Arc::new(std::sync::Mutex::new(None::<crate::message::Message>));
                let block_applied = applied.clone();
                let block_failing = failing_message.clone();
                let group_id = info.group_id.clone();
                let stream_id = claimed.offset.stream_id.clone();
                let worker_id = worker_id.to_string();

                let block: crate::backend::TransactionBlock = Box::new(move |tx| {
                    async move {
                        for pair in pairs {
                            let source = pair.source_message.clone();
                            if let Err(e) = pair.apply_all(tx).await {
                                let applied_so_far = block_applied.load(Ordering::SeqCst);
                                *block_failing.lock().unwrap() = Some(source.clone());
                                return Err(CoreError::partial_batch(applied_so_far, &source, e));
                            }
                            block_applied.fetch_add(1, Ordering::SeqCst);
                        }

                        if let Some(global_seq) = last_global_seq {
                            tx.ack(&group_id, &stream_id, global_seq, &worker_id).await?;
                        }

                        Ok(())
                    }
                    .boxed()
                });

                match self.backend.transaction(block).await {
                    Ok(()) => Ok(true),
                    // A pair's actions failed partway: the transaction
                    // rolled back as a whole, so release the claim and
                    // route the failure through the group's strategy.
                    Err(e @ CoreError::PartialBatch { .. }) => {
                        self.backend
                            .release_claim(&info.group_id, &claimed.offset.stream_id)
                            .await
                            .ok();
                        let failing = failing_message
                            .lock()
                            .unwrap()
                            .clone()
                            .unwrap_or_else(|| first_message.clone());
                        self.handle_failure(&info.group_id, &failing, &e, error_strategy)
                            .await?;
                        Err(e)
                    }
                    // Every pair applied; only the ACK itself failed
                    // (e.g. `ConcurrentAck`). Nothing to roll back into
                    // a retry decision here — surface it as-is.
                    Err(e) => Err(e),
                }
            }
            Err(e) => {
                self.backend
                    .release_claim(&info.group_id, &claimed.offset.stream_id)
                    .await
                    .ok();
                self.handle_failure(&info.group_id, &first_message, &e, error_strategy)
                    .await?;
                Err(e)
            }
        }
    }

    async fn group_is_unavailable(&self, group_id: &str) -> CoreResult<bool> {
        let stats = self.backend.stats().await?;
        if let Some(g) = stats.iter().find(|g| g.group_id == group_id) {
            if g.status == GroupStatus::Stopped {
                return Ok(true);
            }
            if let Some(retry_at) = g.retry_at {
                if retry_at > chrono::Utc::now() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Step 8: route a handler failure through the group's
    /// `ErrorStrategy`, persisting the decision atomically against the
    /// group row.
    async fn handle_failure(
        &self,
        group_id: &str,
        failing_message: &crate::message::Message,
        error: &CoreError,
        error_strategy: &dyn ErrorStrategy,
    ) -> CoreResult<()> {
        error!(group_id, %error, "reactor handler failed");

        let current_context = self.current_error_context(group_id).await?;
        let decision = error_strategy.decide(error, failing_message, &current_context);

        let decision_clone = decision.clone();
        let mutate: Box<dyn FnOnce(&mut dyn GroupUpdater) + Send> = Box::new(move |updater| {
            match decision_clone {
                GroupAction::Retry { at, error_context } => updater.retry(at, error_context),
                GroupAction::Stop { reason } => updater.stop(reason),
            }
        });

        self.backend.updating_consumer_group(group_id, mutate).await?;

        if let GroupAction::Stop { reason } = decision {
            warn!(group_id, reason, "consumer group stopped");
        }
        Ok(())
    }

    async fn current_error_context(&self, group_id: &str) -> CoreResult<serde_json::Value> {
        let stats = self.backend.stats().await?;
        Ok(stats
            .into_iter()
            .find(|g| g.group_id == group_id)
            .map(|g| g.error_context)
            .unwrap_or_else(|| json!({})))
    }
}

/// Convenience used by [`ConsumerGroupInfo`] consumers that only need
/// to know whether a group can currently be dispatched to.
pub fn group_can_dispatch(group: &ConsumerGroupInfo) -> bool {
    group.status == GroupStatus::Active
        && group.retry_at.map(|t| t <= chrono::Utc::now()).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_can_dispatch_is_false_when_stopped() {
        let group = ConsumerGroupInfo {
            id: 1,
            group_id: "g".into(),
            status: GroupStatus::Stopped,
            highest_global_seq: 0,
            retry_at: None,
            error_context: json!({}),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        assert!(!group_can_dispatch(&group));
    }

    #[test]
    fn group_can_dispatch_is_false_during_backoff() {
        let group = ConsumerGroupInfo {
            id: 1,
            group_id: "g".into(),
            status: GroupStatus::Active,
            highest_global_seq: 0,
            retry_at: Some(chrono::Utc::now() + chrono::Duration::seconds(30)),
            error_context: json!({}),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        assert!(!group_can_dispatch(&group));
    }

    #[test]
    fn group_can_dispatch_is_true_when_active_and_past_backoff() {
        let group = ConsumerGroupInfo {
            id: 1,
            group_id: "g".into(),
            status: GroupStatus::Active,
            highest_global_seq: 0,
            retry_at: Some(chrono::Utc::now() - chrono::Duration::seconds(30)),
            error_context: json!({}),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        assert!(group_can_dispatch(&group));
    }
}
