//! The `Backend` contract (C2) and the entities it persists (§3).
//!
//! This module defines the interface only; `reactorcore-postgres` and
//! `reactorcore-sqlite` provide the two production implementations and
//! [`memory::MemoryBackend`] here provides the in-process one the root
//! crate's own tests run against (§10.4 of SPEC_FULL.md).

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::CoreResult;
use crate::message::{BatchEntry, Message};

/// One row per append-addressable stream (§3 Stream).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamInfo {
    pub stream_id: String,
    pub seq: u64,
    pub updated_at: DateTime<Utc>,
}

/// §3 ConsumerGroup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerGroupInfo {
    pub id: i64,
    pub group_id: String,
    pub status: GroupStatus,
    pub highest_global_seq: u64,
    pub retry_at: Option<DateTime<Utc>>,
    pub error_context: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Active,
    Stopped,
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupStatus::Active => write!(f, "active"),
            GroupStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// §3 Offset: "group G has consumed this stream up through `global_seq`."
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OffsetInfo {
    pub group_id: String,
    pub stream_id: String,
    pub global_seq: u64,
    pub claimed: bool,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
}

/// Result of a successful claim (§4.7 steps 2-4): the offset row that
/// was claimed plus the batch of messages beyond it.
#[derive(Debug, Clone)]
pub struct ClaimedBatch {
    pub offset: OffsetInfo,
    pub batch: Vec<BatchEntry>,
    pub history: Option<Vec<Message>>,
}

/// Operational snapshot of one consumer group, for `Backend::stats`
/// (SPEC_FULL.md §11).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerGroupStats {
    pub group_id: String,
    pub status: GroupStatus,
    pub highest_global_seq: u64,
    pub retry_at: Option<DateTime<Utc>>,
    pub error_context: serde_json::Value,
}

/// Where a freshly registered consumer group should start reading from
/// (SPEC_FULL.md §11; spec.md §4.6 `consumer_info.start_from`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StartFrom {
    Beginning,
    Now,
    At(DateTime<Utc>),
    AtSeq(u64),
}

/// A handle a `Backend` hands to `updating_consumer_group` so callers
/// can mutate exactly one group row under its row lock (§4.2).
pub trait GroupUpdater {
    fn stop(&mut self, reason: String);
    fn retry(&mut self, at: DateTime<Utc>, error_context: serde_json::Value);
}

/// The mutating subset of [`Backend`] a [`Backend::transaction`] block
/// is allowed to call — every call made through one handle commits or
/// aborts together (§4.2 `transaction(block)`).
#[async_trait]
pub trait Transaction: Send + Sync {
    async fn append_to_stream(
        &self,
        stream_id: &str,
        messages: Vec<Message>,
        expected_seq: Option<u64>,
    ) -> CoreResult<Vec<Message>>;

    async fn append_next_to_stream(&self, stream_id: &str, messages: Vec<Message>) -> CoreResult<Vec<Message>>;

    async fn schedule_messages(&self, messages: Vec<Message>, at: DateTime<Utc>) -> CoreResult<()>;

    async fn ack(&self, group_id: &str, stream_id: &str, global_seq: u64, worker_id: &str) -> CoreResult<()>;
}

/// A unit of work to run inside one [`Backend::transaction`] call.
/// Higher-ranked over the transaction handle's own lifetime, the same
/// shape `sqlx::Connection::transaction` itself uses, so one signature
/// covers every backend's concrete transaction type.
pub type TransactionBlock =
    Box<dyn for<'tx> FnOnce(&'tx dyn Transaction) -> BoxFuture<'tx, CoreResult<()>> + Send>;

/// The single source-of-truth interface (§4.2). Every method is a
/// discrete, independently-awaitable operation; atomicity requirements
/// are documented per-method and enforced by the implementation (a SQL
/// transaction in the production backends, a single mutex-guarded
/// critical section in [`memory::MemoryBackend`]).
#[async_trait]
pub trait Backend: Send + Sync {
    /// Create tables and indices. Idempotent.
    async fn install(&self) -> CoreResult<()>;

    /// Append `messages` to `stream_id`, atomically. Every message must
    /// carry a `seq` in `expected_seq+1 ..= expected_seq+n`, contiguous
    /// and consistent with `stream_id`; a clash on `(stream_id, seq)`
    /// surfaces [`crate::errors::CoreError::ConcurrentAppend`].
    /// `expected_seq = None` means "stream must not yet exist."
    async fn append_to_stream(
        &self,
        stream_id: &str,
        messages: Vec<Message>,
        expected_seq: Option<u64>,
    ) -> CoreResult<Vec<Message>>;

    /// Append `messages` to `stream_id`, letting the backend assign
    /// consecutive `seq` values starting at `current_seq + 1`. Retries
    /// internally on a unique-constraint race up to a small bound
    /// before surfacing `ConcurrentAppend`.
    async fn append_next_to_stream(
        &self,
        stream_id: &str,
        messages: Vec<Message>,
    ) -> CoreResult<Vec<Message>>;

    /// Insert `messages` into the scheduled table, to be promoted once
    /// `at` has passed.
    async fn schedule_messages(&self, messages: Vec<Message>, at: DateTime<Utc>) -> CoreResult<()>;

    /// Move every scheduled message with `available_at <= now` into the
    /// log (grouped by stream, via `append_next_to_stream`). Returns
    /// how many were promoted.
    async fn update_schedule(&self) -> CoreResult<usize>;

    /// Register a consumer group if it doesn't already exist. No-op on
    /// a group that's already registered.
    async fn register_consumer_group(&self, group_id: &str, start_from: StartFrom) -> CoreResult<()>;

    /// Resume a stopped group: `status <- active`, `retry_at <- None`.
    async fn start_consumer_group(&self, group_id: &str) -> CoreResult<()>;

    /// Stop a group: `status <- stopped`.
    async fn stop_consumer_group(&self, group_id: &str, reason: &str) -> CoreResult<()>;

    /// Clear every offset for `group_id` back to zero while leaving
    /// `highest_global_seq` untouched, so replay is distinguishable
    /// from fresh processing (§3, §8 scenario 6).
    async fn reset_consumer_group(&self, group_id: &str) -> CoreResult<()>;

    /// Find and claim the earliest unclaimed offset for `reactor`'s
    /// group that has new messages of a handled type, then fetch up to
    /// `batch_size` further messages (and full history if
    /// `with_history`). Returns `None` if there is no claimable work
    /// (group stopped/in retry backoff, or no stream has anything new).
    ///
    /// The select-and-claim must happen in one atomic unit (§4.7 steps
    /// 2-3): if two callers race for the same offset, at most one gets
    /// `Some`.
    async fn claim_next_batch(
        &self,
        group_id: &str,
        handled_types: &[String],
        batch_size: usize,
        with_history: bool,
        worker_id: &str,
    ) -> CoreResult<Option<ClaimedBatch>>;

    /// Upsert the offset row for `(group_id, stream_id)` to
    /// `global_seq`, bump `highest_global_seq` to
    /// `max(existing, global_seq)`, and release the claim. Must be a
    /// no-op (not an error) if called again with a `global_seq` that's
    /// already been reached (§8 round-trip law). `worker_id` must match
    /// the claim's current owner, or the ack is rejected with
    /// [`crate::errors::CoreError::ConcurrentAck`] rather than silently
    /// stealing someone else's claim.
    async fn ack(&self, group_id: &str, stream_id: &str, global_seq: u64, worker_id: &str) -> CoreResult<()>;

    /// Release a previously-claimed offset without acknowledging it
    /// (used on handler failure, §4.7 step 8).
    async fn release_claim(&self, group_id: &str, stream_id: &str) -> CoreResult<()>;

    /// Run `block` against a transaction handle shared across every
    /// call it makes: the appends/schedules/ack it issues commit
    /// together, or none of them do (§4.2 `transaction(block)`). This
    /// is how `Router::handle_next_event_for_reactor` applies a
    /// reactor's actions and ACKs the source message as one atomic
    /// unit (§4.7 step 7).
    async fn transaction(&self, block: TransactionBlock) -> CoreResult<()>;

    /// Row-lock `group_id`'s row, apply `mutate` to a [`GroupUpdater`],
    /// and persist the result atomically (§4.2, §4.11).
    async fn updating_consumer_group(
        &self,
        group_id: &str,
        mutate: Box<dyn FnOnce(&mut dyn GroupUpdater) + Send>,
    ) -> CoreResult<()>;

    /// Read a stream in full, or up to (and including) `upto_seq`.
    async fn read_stream(&self, stream_id: &str, upto_seq: Option<u64>) -> CoreResult<Vec<Message>>;

    /// Read every message sharing `message_id`'s correlation id, in
    /// global_seq order.
    async fn read_correlation_batch(&self, message_id: uuid::Uuid) -> CoreResult<Vec<Message>>;

    /// Bulk-upsert heartbeats for currently-running worker ids (§4.9).
    async fn worker_heartbeat(&self, worker_ids: &[String]) -> CoreResult<()>;

    /// Delete claims whose TTL has expired, freeing the corresponding
    /// offsets. Safe to call concurrently with a worker's own release
    /// of the same claim (§8: freed exactly once).
    async fn release_stale_claims(&self, ttl_seconds: i64) -> CoreResult<usize>;

    /// Operational snapshot of every registered consumer group.
    async fn stats(&self) -> CoreResult<Vec<ConsumerGroupStats>>;
}
