//! Deferred side effects returned by a reactor's `handle_batch` (C12).
//!
//! Actions describe *what* to do; the [`Router`](crate::router::Router)
//! is the only thing that ever calls [`Action::execute`], always inside
//! the one transaction that also ACKs the source message (§4.7 step 7).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::backend::Transaction;
use crate::errors::{CoreError, CoreResult};
use crate::message::Message;

/// A closure run inside the applying transaction, given the same
/// transaction handle the Router's appends/ack share — this is what
/// lets a `Projector` reactor persist a read-model row atomically with
/// the message that produced it (§4.6, §7).
pub type SyncFn = Box<dyn for<'tx> FnOnce(&'tx dyn Transaction) -> BoxFuture<'tx, CoreResult<()>> + Send>;

/// One deferred effect produced by a reactor for one source message.
pub enum Action {
    /// Append `messages` to `stream_id` with `expected_seq` equal to the
    /// source message's `seq`. Raises `ConcurrentAppend` on conflict.
    AppendAfter {
        stream_id: String,
        messages: Vec<Message>,
    },
    /// Append `messages` after the current tip of their own stream(s),
    /// letting the backend assign `seq`.
    AppendNext { messages: Vec<Message> },
    /// Insert `messages` into the scheduled table for promotion at `at`.
    Schedule {
        messages: Vec<Message>,
        at: DateTime<Utc>,
    },
    /// Arbitrary synchronous side effect run inside the same
    /// transaction (e.g. a projector persisting a read model row).
    Sync(SyncFn),
    /// Terminal no-append result: acknowledge and move on.
    Ack,
}

impl Action {
    /// Execute this action against `tx`, correlating any messages
    /// against `source` first (§4.12). Returns the messages actually
    /// written, if any.
    pub async fn execute(self, tx: &dyn Transaction, source: &Message) -> CoreResult<Vec<Message>> {
        match self {
            Action::AppendAfter {
                stream_id,
                messages,
            } => {
                let correlated: Vec<Message> = messages
                    .into_iter()
                    .map(|m| source.correlate(m))
                    .collect();
                let expected_seq = source.seq;
                tx.append_to_stream(&stream_id, correlated, expected_seq).await
            }
            Action::AppendNext { messages } => {
                let correlated: Vec<Message> = messages
                    .into_iter()
                    .map(|m| source.correlate(m))
                    .collect();
                append_next_grouped_by_stream(tx, correlated).await
            }
            Action::Schedule { messages, at } => {
                let correlated: Vec<Message> = messages
                    .into_iter()
                    .map(|m| source.correlate(m))
                    .collect();
                tx.schedule_messages(correlated, at).await?;
                Ok(vec![])
            }
            Action::Sync(f) => {
                f(tx).await?;
                Ok(vec![])
            }
            Action::Ack => Ok(vec![]),
        }
    }
}

/// `AppendNext` may carry messages for more than one stream (a
/// projector emitting to several read-model streams, say); group by
/// `stream_id` and delegate each group to `append_next_to_stream`.
async fn append_next_grouped_by_stream(
    tx: &dyn Transaction,
    messages: Vec<Message>,
) -> CoreResult<Vec<Message>> {
    use std::collections::BTreeMap;

    let mut by_stream: BTreeMap<String, Vec<Message>> = BTreeMap::new();
    for m in messages {
        by_stream.entry(m.stream_id.clone()).or_default().push(m);
    }

    let mut written = Vec::new();
    for (stream_id, group) in by_stream {
        let result = tx.append_next_to_stream(&stream_id, group).await?;
        written.extend(result);
    }
    Ok(written)
}

/// A pair returned from `handle_batch`: the actions to apply and the
/// message that caused them (needed for correlation and for the ACK at
/// the end of §4.7 step 7).
pub struct ActionPair {
    pub actions: Vec<Action>,
    pub source_message: Message,
}

impl ActionPair {
    pub fn new(source_message: Message, actions: Vec<Action>) -> Self {
        Self {
            actions,
            source_message,
        }
    }

    pub fn ack_only(source_message: Message) -> Self {
        Self {
            actions: vec![Action::Ack],
            source_message,
        }
    }
}

#[async_trait]
pub(crate) trait ExecuteAll {
    async fn apply_all(self, tx: &dyn Transaction) -> CoreResult<Vec<Message>>;
}

#[async_trait]
impl ExecuteAll for ActionPair {
    async fn apply_all(self, tx: &dyn Transaction) -> CoreResult<Vec<Message>> {
        let mut all_written = Vec::new();
        for action in self.actions {
            let written = action.execute(tx, &self.source_message).await?;
            all_written.extend(written);
        }
        Ok(all_written)
    }
}

/// Guard against mixing stream ids within a single `AppendAfter`/
/// `AppendNext` batch, surfacing `DifferentStreamId` the way a
/// stream-scoped append must (§7).
pub fn assert_single_stream(messages: &[Message]) -> CoreResult<()> {
    let mut iter = messages.iter();
    if let Some(first) = iter.next() {
        for m in iter {
            if m.stream_id != first.stream_id {
                return Err(CoreError::DifferentStreamId(
                    first.stream_id.clone(),
                    m.stream_id.clone(),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assert_single_stream_accepts_matching_ids() {
        let a = Message::new("s1", "evt.A", serde_json::json!({}));
        let b = Message::new("s1", "evt.B", serde_json::json!({}));
        assert!(assert_single_stream(&[a, b]).is_ok());
    }

    #[test]
    fn assert_single_stream_rejects_mixed_ids() {
        let a = Message::new("s1", "evt.A", serde_json::json!({}));
        let b = Message::new("s2", "evt.B", serde_json::json!({}));
        assert!(assert_single_stream(&[a, b]).is_err());
    }

    #[tokio::test]
    async fn sync_action_runs_inside_the_shared_transaction_handle() {
        use crate::backend::memory::MemoryBackend;
        use crate::backend::Backend;
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let backend = MemoryBackend::new();
        let projected = Arc::new(AtomicU32::new(0));
        let source = Message::new("s1", "evt.A", serde_json::json!({}));

        let projected_clone = projected.clone();
        let pair = ActionPair::new(
            source.clone(),
            vec![Action::Sync(Box::new(move |tx| {
                Box::pin(async move {
                    // A projector persisting a read-model row through the
                    // same transaction handle the appends/ack share.
                    tx.append_next_to_stream("projection", vec![Message::new("projection", "evt.Projected", serde_json::json!({}))])
                        .await?;
                    projected_clone.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }))],
        );

        backend
            .transaction(Box::new(move |tx| Box::pin(async move { pair.apply_all(tx).await.map(|_| ()) })))
            .await
            .unwrap();

        assert_eq!(projected.load(Ordering::SeqCst), 1);
        let written = backend.read_stream("projection", None).await.unwrap();
        assert_eq!(written.len(), 1);
    }
}
