//! In-process `Backend` used by the core crate's own test suite and by
//! callers who just want a single-process runtime with no external
//! database (SPEC_FULL.md §10.4) — the Rust counterpart of the Ruby
//! original's in-memory test backend (spec.md §1 Non-goals list it as
//! an external collaborator; using it as *this* crate's own test
//! double is squarely in scope).
//!
//! Correctness, not throughput: every operation takes the single
//! `Mutex<State>` for its whole duration, which gives the "database
//! level single-writer serialization" fallback spec.md's DESIGN NOTES
//! call out as an acceptable substitute for `SKIP LOCKED` (§4.2,
//! §9 "Multiple backend variants").

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{
    Backend, ClaimedBatch, ConsumerGroupInfo, ConsumerGroupStats, GroupStatus, GroupUpdater, OffsetInfo, StartFrom,
    Transaction, TransactionBlock,
};
use crate::errors::{CoreError, CoreResult};
use crate::message::{BatchEntry, Message};

#[derive(Default)]
struct State {
    streams: HashMap<String, u64>,
    messages: Vec<Message>, // append-only, ordered by global_seq
    scheduled: Vec<(Message, chrono::DateTime<Utc>)>,
    groups: HashMap<String, ConsumerGroupInfo>,
    start_points: HashMap<String, u64>,
    offsets: HashMap<(String, String), OffsetInfo>,
    claims: HashMap<(String, String), ClaimMeta>,
    next_group_id: i64,
    heartbeats: HashMap<String, chrono::DateTime<Utc>>,
}

struct ClaimMeta {
    claimed_at: chrono::DateTime<Utc>,
    expires_at: chrono::DateTime<Utc>,
}

pub struct MemoryBackend {
    state: Mutex<State>,
    claim_ttl_seconds: i64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            claim_ttl_seconds: 120,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryGroupUpdater {
    stopped: Option<String>,
    retried: Option<(chrono::DateTime<Utc>, serde_json::Value)>,
}

impl GroupUpdater for MemoryGroupUpdater {
    fn stop(&mut self, reason: String) {
        self.stopped = Some(reason.into());
    }

    fn retry(&mut self, at: chrono::DateTime<Utc>, error_context: serde_json::Value) {
        self.retried = Some((at, error_context));
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn install(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn append_to_stream(
        &self,
        stream_id: &str,
        messages: Vec<Message>,
        expected_seq: Option<u64>,
    ) -> CoreResult<Vec<Message>> {
        crate::actions::assert_single_stream(&messages)?;
        if messages.is_empty() {
            return Ok(vec![]);
        }

        let mut state = self.state.lock().unwrap();
        let current_seq = state.streams.get(stream_id).copied().unwrap_or(0);
        let base = expected_seq.unwrap_or(0);
        if base != current_seq {
            return Err(CoreError::ConcurrentAppend {
                stream_id: stream_id.to_string(),
                seq: base + 1,
            });
        }

        let mut written = Vec::with_capacity(messages.len());
        let mut seq = current_seq;
        for (i, mut m) in messages.into_iter().enumerate() {
            seq += 1;
            let expected = base + 1 + i as u64;
            if m.seq.map(|s| s != expected).unwrap_or(false) {
                return Err(CoreError::ConcurrentAppend {
                    stream_id: stream_id.to_string(),
                    seq: expected,
                });
            }
            m.stream_id = stream_id.to_string();
            m.seq = Some(seq);
            m.global_seq = Some(next_global_seq(&state));
            state.messages.push(m.clone());
            written.push(m);
        }
        state.streams.insert(stream_id.to_string(), seq);
        Ok(written)
    }

    async fn append_next_to_stream(&self, stream_id: &str, messages: Vec<Message>) -> CoreResult<Vec<Message>> {
        crate::actions::assert_single_stream(&messages)?;
        if messages.is_empty() {
            return Ok(vec![]);
        }

        // Unlike `append_to_stream`, the caller has no opinion on the
        // base seq, so a losing race here just means another writer
        // beat us to the tip — retry against the new tip instead of
        // surfacing a conflict the caller never asked to detect.
        const MAX_ATTEMPTS: usize = 5;
        let mut last_err = None;
        for _ in 0..MAX_ATTEMPTS {
            let current_seq = {
                let state = self.state.lock().unwrap();
                state.streams.get(stream_id).copied().unwrap_or(0)
            };
            match self
                .append_to_stream(stream_id, messages.clone(), Some(current_seq))
                .await
            {
                Ok(written) => return Ok(written),
                Err(CoreError::ConcurrentAppend { .. }) => continue,
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            }
        }
        Err(last_err.unwrap_or(CoreError::ConcurrentAppend {
            stream_id: stream_id.to_string(),
            seq: 0,
        }))
    }

    async fn schedule_messages(&self, messages: Vec<Message>, at: chrono::DateTime<Utc>) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap();
        for m in messages {
            state.scheduled.push((m, at));
        }
        Ok(())
    }

    async fn update_schedule(&self) -> CoreResult<usize> {
        let due: Vec<Message> = {
            let mut state = self.state.lock().unwrap();
            let now = Utc::now();
            let mut due = Vec::new();
            state.scheduled.retain(|(m, at)| {
                if *at <= now {
                    due.push(m.clone());
                    false
                } else {
                    true
                }
            });
            due
        };

        if due.is_empty() {
            return Ok(0);
        }

        let mut by_stream: std::collections::BTreeMap<String, Vec<Message>> = std::collections::BTreeMap::new();
        for mut m in due {
            m.created_at = Utc::now();
            m.seq = None;
            by_stream.entry(m.stream_id.clone()).or_default().push(m);
        }

        let mut promoted = 0usize;
        for (stream_id, msgs) in by_stream {
            let n = msgs.len();
            self.append_next_to_stream(&stream_id, msgs).await?;
            promoted += n;
        }
        Ok(promoted)
    }

    async fn register_consumer_group(&self, group_id: &str, start_from: StartFrom) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.groups.contains_key(group_id) {
            return Ok(());
        }
        state.next_group_id += 1;
        let id = state.next_group_id;
        let now = Utc::now();

        let start_point = match start_from {
            StartFrom::Beginning => 0,
            StartFrom::AtSeq(n) => n,
            StartFrom::Now => state.messages.last().and_then(|m| m.global_seq).unwrap_or(0),
            StartFrom::At(at) => state
                .messages
                .iter()
                .filter(|m| m.created_at <= at)
                .filter_map(|m| m.global_seq)
                .max()
                .unwrap_or(0),
        };
        state.start_points.insert(group_id.to_string(), start_point);

        state.groups.insert(
            group_id.to_string(),
            ConsumerGroupInfo {
                id,
                group_id: group_id.to_string(),
                status: GroupStatus::Active,
                highest_global_seq: 0,
                retry_at: None,
                error_context: serde_json::json!({}),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn start_consumer_group(&self, group_id: &str) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(g) = state.groups.get_mut(group_id) {
            g.status = GroupStatus::Active;
            g.retry_at = None;
            g.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn stop_consumer_group(&self, group_id: &str, reason: &str) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(g) = state.groups.get_mut(group_id) {
            g.status = GroupStatus::Stopped;
            g.error_context = serde_json::json!({"reason": reason});
            g.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reset_consumer_group(&self, group_id: &str) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap();
        let keys: Vec<(String, String)> = state
            .offsets
            .keys()
            .filter(|(g, _)| g == group_id)
            .cloned()
            .collect();
        for k in keys {
            state.offsets.remove(&k);
        }
        // highest_global_seq is preserved deliberately (§3, §8 scenario 6).
        Ok(())
    }

    async fn claim_next_batch(
        &self,
        group_id: &str,
        handled_types: &[String],
        batch_size: usize,
        with_history: bool,
        worker_id: &str,
    ) -> CoreResult<Option<ClaimedBatch>> {
        let mut state = self.state.lock().unwrap();

        let group = match state.groups.get(group_id) {
            Some(g) => g.clone(),
            None => return Ok(None),
        };
        if group.status == GroupStatus::Stopped {
            return Ok(None);
        }
        if let Some(retry_at) = group.retry_at {
            if retry_at > Utc::now() {
                return Ok(None);
            }
        }

        let stream_ids: Vec<String> = {
            let mut seen = std::collections::BTreeSet::new();
            for m in state.messages.iter().filter(|m| handled_types.contains(&m.r#type)) {
                seen.insert(m.stream_id.clone());
            }
            seen.into_iter().collect()
        };

        for stream_id in stream_ids {
            let offset_key = (group_id.to_string(), stream_id.clone());
            let already_claimed = state
                .offsets
                .get(&offset_key)
                .map(|o| o.claimed)
                .unwrap_or(false);
            if already_claimed {
                continue;
            }

            let start_point = state.start_points.get(group_id).copied().unwrap_or(0);
            let offset_global_seq = state.offsets.get(&offset_key).map(|o| o.global_seq).unwrap_or(start_point);

            let mut candidates: Vec<Message> = state
                .messages
                .iter()
                .filter(|m| {
                    m.stream_id == stream_id
                        && handled_types.contains(&m.r#type)
                        && m.global_seq.unwrap_or(0) > offset_global_seq
                })
                .cloned()
                .collect();
            candidates.sort_by_key(|m| m.global_seq.unwrap_or(0));

            if candidates.is_empty() {
                continue;
            }
            candidates.truncate(batch_size.max(1));

            let now = Utc::now();
            let offset = state
                .offsets
                .entry(offset_key.clone())
                .or_insert_with(|| OffsetInfo {
                    group_id: group_id.to_string(),
                    stream_id: stream_id.clone(),
                    global_seq: start_point,
                    claimed: false,
                    claimed_at: None,
                    claimed_by: None,
                });
            offset.claimed = true;
            offset.claimed_at = Some(now);
            offset.claimed_by = Some(worker_id.to_string());
            let offset_snapshot = offset.clone();

            state.claims.insert(
                offset_key,
                ClaimMeta {
                    claimed_at: now,
                    expires_at: now + chrono::Duration::seconds(self.claim_ttl_seconds),
                },
            );

            let highest = group.highest_global_seq;
            let batch: Vec<BatchEntry> = candidates
                .into_iter()
                .map(|message| {
                    let replaying = message.global_seq.unwrap_or(0) <= highest;
                    BatchEntry { message, replaying }
                })
                .collect();

            let history = if with_history {
                let mut h: Vec<Message> = state.messages.iter().filter(|m| m.stream_id == stream_id).cloned().collect();
                h.sort_by_key(|m| m.seq.unwrap_or(0));
                Some(h)
            } else {
                None
            };

            return Ok(Some(ClaimedBatch {
                offset: offset_snapshot,
                batch,
                history,
            }));
        }

        Ok(None)
    }

    async fn ack(&self, group_id: &str, stream_id: &str, global_seq: u64, worker_id: &str) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap();
        let key = (group_id.to_string(), stream_id.to_string());

        if let Some(existing) = state.offsets.get(&key) {
            if existing.claimed {
                if let Some(claimed_by) = &existing.claimed_by {
                    if claimed_by != worker_id {
                        return Err(CoreError::ConcurrentAck {
                            group_id: group_id.to_string(),
                            stream_id: stream_id.to_string(),
                        });
                    }
                }
            }
        }

        let offset = state.offsets.entry(key.clone()).or_insert_with(|| OffsetInfo {
            group_id: group_id.to_string(),
            stream_id: stream_id.to_string(),
            global_seq: 0,
            claimed: false,
            claimed_at: None,
            claimed_by: None,
        });
        if global_seq > offset.global_seq {
            offset.global_seq = global_seq;
        }
        offset.claimed = false;
        offset.claimed_at = None;
        offset.claimed_by = None;
        state.claims.remove(&key);

        if let Some(g) = state.groups.get_mut(group_id) {
            g.highest_global_seq = g.highest_global_seq.max(global_seq);
            g.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn release_claim(&self, group_id: &str, stream_id: &str) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap();
        let key = (group_id.to_string(), stream_id.to_string());
        if let Some(offset) = state.offsets.get_mut(&key) {
            offset.claimed = false;
            offset.claimed_at = None;
            offset.claimed_by = None;
        }
        state.claims.remove(&key);
        Ok(())
    }

    /// `State`'s single `Mutex` already serializes every individual
    /// call; there is no cross-call rollback here (§9 "an in-memory
    /// backend is an acceptable single-writer-serialization substitute"),
    /// so `block` runs straight against a handle that forwards each call
    /// to this same backend.
    async fn transaction(&self, block: TransactionBlock) -> CoreResult<()> {
        let tx = MemoryTransaction { backend: self };
        block(&tx).await
    }

    async fn updating_consumer_group(
        &self,
        group_id: &str,
        mutate: Box<dyn FnOnce(&mut dyn GroupUpdater) + Send>,
    ) -> CoreResult<()> {
        let mut updater = MemoryGroupUpdater {
            stopped: None,
            retried: None,
        };
        mutate(&mut updater);

        let mut state = self.state.lock().unwrap();
        if let Some(g) = state.groups.get_mut(group_id) {
            if let Some(reason) = updater.stopped {
                g.status = GroupStatus::Stopped;
                g.error_context = serde_json::json!({"reason": reason});
            }
            if let Some((at, ctx)) = updater.retried {
                g.retry_at = Some(at);
                g.error_context = ctx;
            }
            g.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn read_stream(&self, stream_id: &str, upto_seq: Option<u64>) -> CoreResult<Vec<Message>> {
        let state = self.state.lock().unwrap();
        let mut msgs: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.stream_id == stream_id)
            .filter(|m| upto_seq.map(|cap| m.seq.unwrap_or(0) <= cap).unwrap_or(true))
            .cloned()
            .collect();
        msgs.sort_by_key(|m| m.seq.unwrap_or(0));
        Ok(msgs)
    }

    async fn read_correlation_batch(&self, message_id: Uuid) -> CoreResult<Vec<Message>> {
        let state = self.state.lock().unwrap();
        let correlation_id = state
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .and_then(|m| m.correlation_id)
            .unwrap_or(message_id);

        let mut msgs: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.correlation_id == Some(correlation_id))
            .cloned()
            .collect();
        msgs.sort_by_key(|m| m.global_seq.unwrap_or(0));
        Ok(msgs)
    }

    async fn worker_heartbeat(&self, worker_ids: &[String]) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        for id in worker_ids {
            state.heartbeats.insert(id.clone(), now);
        }
        Ok(())
    }

    async fn release_stale_claims(&self, ttl_seconds: i64) -> CoreResult<usize> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let stale: Vec<(String, String)> = state
            .claims
            .iter()
            .filter(|(_, meta)| meta.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();

        let _ = ttl_seconds; // expires_at was computed at claim time using this TTL.
        let n = stale.len();
        for key in stale {
            state.claims.remove(&key);
            if let Some(offset) = state.offsets.get_mut(&key) {
                offset.claimed = false;
                offset.claimed_at = None;
                offset.claimed_by = None;
            }
        }
        Ok(n)
    }

    async fn stats(&self) -> CoreResult<Vec<ConsumerGroupStats>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .groups
            .values()
            .map(|g| ConsumerGroupStats {
                group_id: g.group_id.clone(),
                status: g.status,
                highest_global_seq: g.highest_global_seq,
                retry_at: g.retry_at,
                error_context: g.error_context.clone(),
            })
            .collect())
    }
}

fn next_global_seq(state: &State) -> u64 {
    state.messages.len() as u64 + 1
}

struct MemoryTransaction<'a> {
    backend: &'a MemoryBackend,
}

#[async_trait]
impl Transaction for MemoryTransaction<'_> {
    async fn append_to_stream(
        &self,
        stream_id: &str,
        messages: Vec<Message>,
        expected_seq: Option<u64>,
    ) -> CoreResult<Vec<Message>> {
        self.backend.append_to_stream(stream_id, messages, expected_seq).await
    }

    async fn append_next_to_stream(&self, stream_id: &str, messages: Vec<Message>) -> CoreResult<Vec<Message>> {
        self.backend.append_next_to_stream(stream_id, messages).await
    }

    async fn schedule_messages(&self, messages: Vec<Message>, at: chrono::DateTime<Utc>) -> CoreResult<()> {
        self.backend.schedule_messages(messages, at).await
    }

    async fn ack(&self, group_id: &str, stream_id: &str, global_seq: u64, worker_id: &str) -> CoreResult<()> {
        self.backend.ack(group_id, stream_id, global_seq, worker_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(stream: &str, ty: &str) -> Message {
        Message::new(stream, ty, serde_json::json!({}))
    }

    #[tokio::test]
    async fn append_assigns_monotonic_seq_and_global_seq() {
        let backend = MemoryBackend::new();
        let written = backend
            .append_next_to_stream("s1", vec![msg("s1", "e.A"), msg("s1", "e.B")])
            .await
            .unwrap();
        assert_eq!(written[0].seq, Some(1));
        assert_eq!(written[1].seq, Some(2));
        assert!(written[0].global_seq.unwrap() < written[1].global_seq.unwrap());
    }

    #[tokio::test]
    async fn concurrent_append_conflict_is_detected() {
        let backend = MemoryBackend::new();
        backend
            .append_to_stream("s1", vec![msg("s1", "e.A").with_seq(1)], Some(0))
            .await
            .unwrap();

        let result = backend
            .append_to_stream("s1", vec![msg("s1", "e.B").with_seq(1)], Some(0))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn empty_batch_append_is_a_no_op() {
        let backend = MemoryBackend::new();
        let written = backend.append_next_to_stream("s1", vec![]).await.unwrap();
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn claim_then_ack_round_trips_offset() {
        let backend = MemoryBackend::new();
        backend.register_consumer_group("g1", StartFrom::Beginning).await.unwrap();
        backend
            .append_next_to_stream("s1", vec![msg("s1", "e.A")])
            .await
            .unwrap();

        let claimed = backend
            .claim_next_batch("g1", &["e.A".to_string()], 10, false, "w1")
            .await
            .unwrap()
            .expect("claimable batch");
        assert_eq!(claimed.batch.len(), 1);

        let global_seq = claimed.batch[0].message.global_seq.unwrap();
        backend.ack("g1", "s1", global_seq, "w1").await.unwrap();

        let again = backend
            .claim_next_batch("g1", &["e.A".to_string()], 10, false, "w1")
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn second_worker_cannot_claim_the_same_stream() {
        let backend = MemoryBackend::new();
        backend.register_consumer_group("g1", StartFrom::Beginning).await.unwrap();
        backend
            .append_next_to_stream("s1", vec![msg("s1", "e.A")])
            .await
            .unwrap();

        let first = backend
            .claim_next_batch("g1", &["e.A".to_string()], 10, false, "w1")
            .await
            .unwrap();
        assert!(first.is_some());

        let second = backend
            .claim_next_batch("g1", &["e.A".to_string()], 10, false, "w2")
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn ack_from_the_wrong_worker_is_rejected() {
        let backend = MemoryBackend::new();
        backend.register_consumer_group("g1", StartFrom::Beginning).await.unwrap();
        backend
            .append_next_to_stream("s1", vec![msg("s1", "e.A")])
            .await
            .unwrap();

        let claimed = backend
            .claim_next_batch("g1", &["e.A".to_string()], 10, false, "w1")
            .await
            .unwrap()
            .expect("claimable batch");
        let global_seq = claimed.batch[0].message.global_seq.unwrap();

        let result = backend.ack("g1", "s1", global_seq, "w2").await;
        assert!(matches!(result, Err(CoreError::ConcurrentAck { .. })));
    }

    #[tokio::test]
    async fn reset_clears_offsets_but_preserves_highest_global_seq() {
        let backend = MemoryBackend::new();
        backend.register_consumer_group("g1", StartFrom::Beginning).await.unwrap();
        backend
            .append_next_to_stream("s1", vec![msg("s1", "e.A")])
            .await
            .unwrap();
        let claimed = backend
            .claim_next_batch("g1", &["e.A".to_string()], 10, false, "w1")
            .await
            .unwrap()
            .unwrap();
        let global_seq = claimed.batch[0].message.global_seq.unwrap();
        backend.ack("g1", "s1", global_seq, "w1").await.unwrap();

        backend.reset_consumer_group("g1").await.unwrap();

        let stats = backend.stats().await.unwrap();
        let g = stats.iter().find(|g| g.group_id == "g1").unwrap();
        assert_eq!(g.highest_global_seq, global_seq);

        let claimed_again = backend
            .claim_next_batch("g1", &["e.A".to_string()], 10, false, "w1")
            .await
            .unwrap()
            .expect("offset reset makes the message claimable again");
        assert!(claimed_again.batch[0].replaying);
    }

    #[tokio::test]
    async fn schedule_then_promote_moves_message_into_the_stream() {
        let backend = MemoryBackend::new();
        let future_msg = msg("s1", "e.Scheduled");
        let past = Utc::now() - chrono::Duration::seconds(1);
        backend.schedule_messages(vec![future_msg], past).await.unwrap();

        let n = backend.update_schedule().await.unwrap();
        assert_eq!(n, 1);

        let stream = backend.read_stream("s1", None).await.unwrap();
        assert_eq!(stream.len(), 1);
        assert_eq!(stream[0].r#type, "e.Scheduled");
    }

    #[tokio::test]
    async fn stale_claims_are_reaped_exactly_once() {
        let backend = MemoryBackend {
            state: Mutex::new(State::default()),
            claim_ttl_seconds: -1, // already expired as soon as claimed
        };
        backend.register_consumer_group("g1", StartFrom::Beginning).await.unwrap();
        backend
            .append_next_to_stream("s1", vec![msg("s1", "e.A")])
            .await
            .unwrap();
        backend
            .claim_next_batch("g1", &["e.A".to_string()], 10, false, "w1")
            .await
            .unwrap();

        let reaped_first = backend.release_stale_claims(120).await.unwrap();
        assert_eq!(reaped_first, 1);
        let reaped_second = backend.release_stale_claims(120).await.unwrap();
        assert_eq!(reaped_second, 0);
    }

    #[tokio::test]
    async fn stopped_group_returns_no_work_and_mutates_nothing() {
        let backend = MemoryBackend::new();
        backend.register_consumer_group("g1", StartFrom::Beginning).await.unwrap();
        backend.stop_consumer_group("g1", "boom").await.unwrap();
        backend
            .append_next_to_stream("s1", vec![msg("s1", "e.A")])
            .await
            .unwrap();

        let claimed = backend
            .claim_next_batch("g1", &["e.A".to_string()], 10, false, "w1")
            .await
            .unwrap();
        assert!(claimed.is_none());
    }
}
