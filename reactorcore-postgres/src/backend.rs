//! `Backend` implementation over PostgreSQL: `SKIP LOCKED` claiming,
//! row-lock-guarded consumer group mutation, trigger-driven `NOTIFY`
//! (see `migrations/0001_init.sql` and [`crate::notifier`]).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use reactorcore::backend::{
    Backend, ClaimedBatch, ConsumerGroupStats, GroupStatus, GroupUpdater, OffsetInfo, StartFrom, Transaction,
    TransactionBlock,
};
use reactorcore::errors::{CoreError, CoreResult};
use reactorcore::message::{BatchEntry, Message};

use crate::error::PostgresError;

pub struct PostgresBackend {
    pool: PgPool,
    claim_ttl_seconds: i64,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            claim_ttl_seconds: 120,
        }
    }

    pub fn with_claim_ttl_seconds(mut self, seconds: i64) -> Self {
        self.claim_ttl_seconds = seconds;
        self
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    stream_id: String,
    seq: i64,
    global_seq: i64,
    r#type: String,
    causation_id: Option<Uuid>,
    correlation_id: Option<Uuid>,
    metadata: Value,
    payload: Value,
    created_at: DateTime<Utc>,
}

impl MessageRow {
    fn into_message(self) -> Message {
        Message {
            id: self.id,
            stream_id: self.stream_id,
            r#type: self.r#type,
            seq: Some(self.seq as u64),
            global_seq: Some(self.global_seq as u64),
            causation_id: self.causation_id,
            correlation_id: self.correlation_id,
            metadata: self.metadata,
            payload: self.payload,
            created_at: self.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ScheduledRow {
    id: Uuid,
    stream_id: String,
    r#type: String,
    causation_id: Option<Uuid>,
    correlation_id: Option<Uuid>,
    metadata: Value,
    payload: Value,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

impl ScheduledRow {
    fn into_message(self, promoted_at: DateTime<Utc>) -> Message {
        Message {
            id: self.id,
            stream_id: self.stream_id,
            r#type: self.r#type,
            seq: None,
            global_seq: None,
            causation_id: self.causation_id,
            correlation_id: self.correlation_id,
            metadata: self.metadata,
            payload: self.payload,
            created_at: promoted_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct OffsetRow {
    group_id: String,
    stream_id: String,
    global_seq: i64,
    claimed: bool,
    claimed_at: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
}

impl OffsetRow {
    fn into_offset_info(self) -> OffsetInfo {
        OffsetInfo {
            group_id: self.group_id,
            stream_id: self.stream_id,
            global_seq: self.global_seq as u64,
            claimed: self.claimed,
            claimed_at: self.claimed_at,
            claimed_by: self.claimed_by,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ConsumerGroupRow {
    group_id: String,
    status: String,
    highest_global_seq: i64,
    retry_at: Option<DateTime<Utc>>,
    error_context: Value,
}

impl ConsumerGroupRow {
    fn status(&self) -> GroupStatus {
        if self.status == "stopped" {
            GroupStatus::Stopped
        } else {
            GroupStatus::Active
        }
    }
}

#[derive(sqlx::FromRow)]
struct ClaimRow {
    claimed: bool,
    claimed_by: Option<String>,
}

fn pg_err(e: sqlx::Error) -> CoreError {
    PostgresError::from(e).into()
}

/// A unique-constraint hit on `(stream_id, seq)` means a concurrent
/// writer won the race; surface it as the conflict the trait promises
/// rather than an opaque backend error.
fn append_err(e: sqlx::Error, stream_id: &str, seq: u64) -> CoreError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() {
            return CoreError::ConcurrentAppend {
                stream_id: stream_id.to_string(),
                seq,
            };
        }
    }
    pg_err(e)
}

#[async_trait]
impl Backend for PostgresBackend {
    async fn install(&self) -> CoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await.map_err(|e| {
            CoreError::Backend(PostgresError::from(e).to_string())
        })?;
        Ok(())
    }

    async fn append_to_stream(
        &self,
        stream_id: &str,
        messages: Vec<Message>,
        expected_seq: Option<u64>,
    ) -> CoreResult<Vec<Message>> {
        let mut tx = self.pool.begin().await.map_err(pg_err)?;
        let written = append_to_stream_core(&mut tx, stream_id, messages, expected_seq).await?;
        tx.commit().await.map_err(pg_err)?;
        Ok(written)
    }

    async fn append_next_to_stream(&self, stream_id: &str, messages: Vec<Message>) -> CoreResult<Vec<Message>> {
        let mut tx = self.pool.begin().await.map_err(pg_err)?;
        let written = append_next_to_stream_core(&mut tx, stream_id, messages).await?;
        tx.commit().await.map_err(pg_err)?;
        Ok(written)
    }

    async fn schedule_messages(&self, messages: Vec<Message>, at: DateTime<Utc>) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(pg_err)?;
        schedule_messages_core(&mut tx, messages, at).await?;
        tx.commit().await.map_err(pg_err)?;
        Ok(())
    }

    async fn update_schedule(&self) -> CoreResult<usize> {
        // Delete the due rows and append them to their target streams in
        // the same transaction (§4.7, DESIGN.md's schedule-atomicity
        // decision) — a failed append leaves the scheduled row in place.
        let mut tx = self.pool.begin().await.map_err(pg_err)?;
        let promoted = update_schedule_core(&mut tx).await?;
        tx.commit().await.map_err(pg_err)?;
        Ok(promoted)
    }

    async fn register_consumer_group(&self, group_id: &str, start_from: StartFrom) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(pg_err)?;

        let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM consumer_groups WHERE group_id = $1")
            .bind(group_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(pg_err)?;
        if existing.is_some() {
            tx.commit().await.map_err(pg_err)?;
            return Ok(());
        }

        let start_global_seq: i64 = match start_from {
            StartFrom::Beginning => 0,
            StartFrom::AtSeq(n) => n as i64,
            StartFrom::Now => sqlx::query_scalar("SELECT COALESCE(MAX(global_seq), 0) FROM messages")
                .fetch_one(&mut *tx)
                .await
                .map_err(pg_err)?,
            StartFrom::At(at) => sqlx::query_scalar(
                "SELECT COALESCE(MAX(global_seq), 0) FROM messages WHERE created_at <= $1",
            )
            .bind(at)
            .fetch_one(&mut *tx)
            .await
            .map_err(pg_err)?,
        };

        sqlx::query("INSERT INTO consumer_groups (group_id, status, start_global_seq) VALUES ($1, 'active', $2)")
            .bind(group_id)
            .bind(start_global_seq)
            .execute(&mut *tx)
            .await
            .map_err(pg_err)?;

        tx.commit().await.map_err(pg_err)?;
        Ok(())
    }

    async fn start_consumer_group(&self, group_id: &str) -> CoreResult<()> {
        sqlx::query("UPDATE consumer_groups SET status = 'active', retry_at = NULL, updated_at = now() WHERE group_id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn stop_consumer_group(&self, group_id: &str, reason: &str) -> CoreResult<()> {
        sqlx::query("UPDATE consumer_groups SET status = 'stopped', error_context = $1, updated_at = now() WHERE group_id = $2")
            .bind(serde_json::json!({"reason": reason}))
            .bind(group_id)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn reset_consumer_group(&self, group_id: &str) -> CoreResult<()> {
        sqlx::query("DELETE FROM offsets WHERE group_id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
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
        let mut tx = self.pool.begin().await.map_err(pg_err)?;

        let group: Option<ConsumerGroupRow> = sqlx::query_as(
            "SELECT group_id, status, highest_global_seq, retry_at, error_context FROM consumer_groups WHERE group_id = $1",
        )
        .bind(group_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(pg_err)?;

        let Some(group) = group else {
            tx.commit().await.ok();
            return Ok(None);
        };
        if group.status() == GroupStatus::Stopped {
            tx.commit().await.ok();
            return Ok(None);
        }
        if let Some(retry_at) = group.retry_at {
            if retry_at > Utc::now() {
                tx.commit().await.ok();
                return Ok(None);
            }
        }

        sqlx::query(
            "INSERT INTO offsets (group_id, stream_id, global_seq)
             SELECT $1, m.stream_id, cg.start_global_seq
             FROM messages m, consumer_groups cg
             WHERE m.type = ANY($2) AND cg.group_id = $1
             ON CONFLICT (group_id, stream_id) DO NOTHING",
        )
        .bind(group_id)
        .bind(handled_types)
        .execute(&mut *tx)
        .await
        .map_err(pg_err)?;

        let offset: Option<OffsetRow> = sqlx::query_as(
            "SELECT group_id, stream_id, global_seq, claimed, claimed_at, claimed_by
             FROM offsets o
             WHERE o.group_id = $1 AND NOT o.claimed
               AND EXISTS (
                 SELECT 1 FROM messages m
                 WHERE m.stream_id = o.stream_id AND m.type = ANY($2) AND m.global_seq > o.global_seq
               )
             ORDER BY o.stream_id
             FOR UPDATE SKIP LOCKED
             LIMIT 1",
        )
        .bind(group_id)
        .bind(handled_types)
        .fetch_optional(&mut *tx)
        .await
        .map_err(pg_err)?;

        let Some(offset) = offset else {
            tx.commit().await.map_err(pg_err)?;
            return Ok(None);
        };

        let expires_at = Utc::now() + chrono::Duration::seconds(self.claim_ttl_seconds);
        sqlx::query(
            "UPDATE offsets SET claimed = true, claimed_at = now(), claimed_by = $1, claim_expires_at = $2
             WHERE group_id = $3 AND stream_id = $4",
        )
        .bind(worker_id)
        .bind(expires_at)
        .bind(group_id)
        .bind(&offset.stream_id)
        .execute(&mut *tx)
        .await
        .map_err(pg_err)?;

        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, stream_id, seq, global_seq, type, causation_id, correlation_id, metadata, payload, created_at
             FROM messages
             WHERE stream_id = $1 AND type = ANY($2) AND global_seq > $3
             ORDER BY global_seq
             LIMIT $4",
        )
        .bind(&offset.stream_id)
        .bind(handled_types)
        .bind(offset.global_seq)
        .bind(batch_size.max(1) as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(pg_err)?;

        let highest = group.highest_global_seq as u64;
        let batch: Vec<BatchEntry> = rows
            .into_iter()
            .map(|row| {
                let message = row.into_message();
                let replaying = message.global_seq.unwrap_or(0) <= highest;
                BatchEntry { message, replaying }
            })
            .collect();

        let history = if with_history {
            let hrows: Vec<MessageRow> = sqlx::query_as(
                "SELECT id, stream_id, seq, global_seq, type, causation_id, correlation_id, metadata, payload, created_at
                 FROM messages WHERE stream_id = $1 ORDER BY seq",
            )
            .bind(&offset.stream_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(pg_err)?;
            Some(hrows.into_iter().map(|r| r.into_message()).collect())
        } else {
            None
        };

        tx.commit().await.map_err(pg_err)?;

        Ok(Some(ClaimedBatch {
            offset: offset.into_offset_info(),
            batch,
            history,
        }))
    }

    async fn ack(&self, group_id: &str, stream_id: &str, global_seq: u64, worker_id: &str) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(pg_err)?;
        ack_core(&mut tx, group_id, stream_id, global_seq, worker_id).await?;
        tx.commit().await.map_err(pg_err)?;
        Ok(())
    }

    async fn release_claim(&self, group_id: &str, stream_id: &str) -> CoreResult<()> {
        sqlx::query(
            "UPDATE offsets SET claimed = false, claimed_at = NULL, claimed_by = NULL, claim_expires_at = NULL
             WHERE group_id = $1 AND stream_id = $2",
        )
        .bind(group_id)
        .bind(stream_id)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn transaction(&self, block: TransactionBlock) -> CoreResult<()> {
        let tx = self.pool.begin().await.map_err(pg_err)?;
        let wrapper = PgTransaction {
            inner: Mutex::new(tx),
        };
        let result = block(&wrapper).await;
        let inner = wrapper.inner.into_inner();
        match result {
            Ok(()) => {
                inner.commit().await.map_err(pg_err)?;
                Ok(())
            }
            Err(e) => {
                inner.rollback().await.ok();
                Err(e)
            }
        }
    }

    async fn updating_consumer_group(
        &self,
        group_id: &str,
        mutate: Box<dyn FnOnce(&mut dyn GroupUpdater) + Send>,
    ) -> CoreResult<()> {
        struct RecordingUpdater {
            stopped: Option<String>,
            retried: Option<(DateTime<Utc>, Value)>,
        }
        impl GroupUpdater for RecordingUpdater {
            fn stop(&mut self, reason: String) {
                self.stopped = Some(reason.into());
            }
            fn retry(&mut self, at: DateTime<Utc>, error_context: Value) {
                self.retried = Some((at, error_context));
            }
        }

        let mut tx = self.pool.begin().await.map_err(pg_err)?;

        let _lock: Option<(i64,)> = sqlx::query_as("SELECT id FROM consumer_groups WHERE group_id = $1 FOR UPDATE")
            .bind(group_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(pg_err)?;

        let mut updater = RecordingUpdater {
            stopped: None,
            retried: None,
        };
        mutate(&mut updater);

        if let Some(reason) = updater.stopped {
            sqlx::query("UPDATE consumer_groups SET status = 'stopped', error_context = $1, updated_at = now() WHERE group_id = $2")
                .bind(serde_json::json!({"reason": reason}))
                .bind(group_id)
                .execute(&mut *tx)
                .await
                .map_err(pg_err)?;
        }
        if let Some((at, ctx)) = updater.retried {
            sqlx::query("UPDATE consumer_groups SET retry_at = $1, error_context = $2, updated_at = now() WHERE group_id = $3")
                .bind(at)
                .bind(ctx)
                .bind(group_id)
                .execute(&mut *tx)
                .await
                .map_err(pg_err)?;
        }

        tx.commit().await.map_err(pg_err)?;
        Ok(())
    }

    async fn read_stream(&self, stream_id: &str, upto_seq: Option<u64>) -> CoreResult<Vec<Message>> {
        let rows: Vec<MessageRow> = match upto_seq {
            Some(cap) => sqlx::query_as(
                "SELECT id, stream_id, seq, global_seq, type, causation_id, correlation_id, metadata, payload, created_at
                 FROM messages WHERE stream_id = $1 AND seq <= $2 ORDER BY seq",
            )
            .bind(stream_id)
            .bind(cap as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(pg_err)?,
            None => sqlx::query_as(
                "SELECT id, stream_id, seq, global_seq, type, causation_id, correlation_id, metadata, payload, created_at
                 FROM messages WHERE stream_id = $1 ORDER BY seq",
            )
            .bind(stream_id)
            .fetch_all(&self.pool)
            .await
            .map_err(pg_err)?,
        };
        Ok(rows.into_iter().map(|r| r.into_message()).collect())
    }

    async fn read_correlation_batch(&self, message_id: Uuid) -> CoreResult<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, stream_id, seq, global_seq, type, causation_id, correlation_id, metadata, payload, created_at
             FROM messages
             WHERE correlation_id = (
                 SELECT COALESCE(correlation_id, id) FROM messages WHERE id = $1
             )
             ORDER BY global_seq",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(rows.into_iter().map(|r| r.into_message()).collect())
    }

    async fn worker_heartbeat(&self, worker_ids: &[String]) -> CoreResult<()> {
        for id in worker_ids {
            sqlx::query(
                "INSERT INTO workers (worker_id, last_heartbeat_at) VALUES ($1, now())
                 ON CONFLICT (worker_id) DO UPDATE SET last_heartbeat_at = now()",
            )
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
        }
        Ok(())
    }

    async fn release_stale_claims(&self, ttl_seconds: i64) -> CoreResult<usize> {
        let _ = ttl_seconds; // claim_expires_at was computed at claim time using self.claim_ttl_seconds.
        let result = sqlx::query(
            "UPDATE offsets SET claimed = false, claimed_at = NULL, claimed_by = NULL, claim_expires_at = NULL
             WHERE claimed AND claim_expires_at <= now()",
        )
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn stats(&self) -> CoreResult<Vec<ConsumerGroupStats>> {
        let rows: Vec<ConsumerGroupRow> = sqlx::query_as(
            "SELECT group_id, status, highest_global_seq, retry_at, error_context FROM consumer_groups",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(rows
            .into_iter()
            .map(|r| ConsumerGroupStats {
                group_id: r.group_id.clone(),
                status: r.status(),
                highest_global_seq: r.highest_global_seq as u64,
                retry_at: r.retry_at,
                error_context: r.error_context.clone(),
            })
            .collect())
    }
}

/// A [`Transaction`] handle sharing one `sqlx` transaction across every
/// call made through it, guarded by a `tokio::sync::Mutex` since the
/// trait's methods take `&self` but `sqlx::Transaction` needs `&mut`
/// access. Each call borrows the connection for just its own query.
struct PgTransaction<'c> {
    inner: Mutex<sqlx::Transaction<'c, sqlx::Postgres>>,
}

#[async_trait]
impl Transaction for PgTransaction<'_> {
    async fn append_to_stream(
        &self,
        stream_id: &str,
        messages: Vec<Message>,
        expected_seq: Option<u64>,
    ) -> CoreResult<Vec<Message>> {
        let mut guard = self.inner.lock().await;
        append_to_stream_core(&mut guard, stream_id, messages, expected_seq).await
    }

    async fn append_next_to_stream(&self, stream_id: &str, messages: Vec<Message>) -> CoreResult<Vec<Message>> {
        let mut guard = self.inner.lock().await;
        append_next_to_stream_core(&mut guard, stream_id, messages).await
    }

    async fn schedule_messages(&self, messages: Vec<Message>, at: DateTime<Utc>) -> CoreResult<()> {
        let mut guard = self.inner.lock().await;
        schedule_messages_core(&mut guard, messages, at).await
    }

    async fn ack(&self, group_id: &str, stream_id: &str, global_seq: u64, worker_id: &str) -> CoreResult<()> {
        let mut guard = self.inner.lock().await;
        ack_core(&mut guard, group_id, stream_id, global_seq, worker_id).await
    }
}

/// The actual `append_to_stream` SQL, taking a bare connection so it can
/// run either inside a method's own auto-committing transaction or
/// inside a shared [`PgTransaction`] handle.
async fn append_to_stream_core(
    conn: &mut sqlx::PgConnection,
    stream_id: &str,
    messages: Vec<Message>,
    expected_seq: Option<u64>,
) -> CoreResult<Vec<Message>> {
    reactorcore::actions::assert_single_stream(&messages)?;
    if messages.is_empty() {
        return Ok(vec![]);
    }

    sqlx::query("INSERT INTO streams (stream_id, seq) VALUES ($1, 0) ON CONFLICT (stream_id) DO NOTHING")
        .bind(stream_id)
        .execute(&mut *conn)
        .await
        .map_err(pg_err)?;

    let current_seq: i64 = sqlx::query_scalar("SELECT seq FROM streams WHERE stream_id = $1 FOR UPDATE")
        .bind(stream_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(pg_err)?;

    let base = expected_seq.map(|s| s as i64).unwrap_or(0);
    if base != current_seq {
        return Err(CoreError::ConcurrentAppend {
            stream_id: stream_id.to_string(),
            seq: (base + 1) as u64,
        });
    }

    let mut written = Vec::with_capacity(messages.len());
    let mut seq = current_seq;
    for m in messages {
        seq += 1;
        let row: MessageRow = sqlx::query_as(
            "INSERT INTO messages (id, stream_id, seq, type, causation_id, correlation_id, metadata, payload, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING id, stream_id, seq, global_seq, type, causation_id, correlation_id, metadata, payload, created_at",
        )
        .bind(m.id)
        .bind(stream_id)
        .bind(seq)
        .bind(&m.r#type)
        .bind(m.causation_id)
        .bind(m.correlation_id)
        .bind(&m.metadata)
        .bind(&m.payload)
        .bind(m.created_at)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| append_err(e, stream_id, seq as u64))?;
        written.push(row.into_message());
    }

    sqlx::query("UPDATE streams SET seq = $1, updated_at = now() WHERE stream_id = $2")
        .bind(seq)
        .bind(stream_id)
        .execute(&mut *conn)
        .await
        .map_err(pg_err)?;

    Ok(written)
}

async fn append_next_to_stream_core(
    conn: &mut sqlx::PgConnection,
    stream_id: &str,
    messages: Vec<Message>,
) -> CoreResult<Vec<Message>> {
    reactorcore::actions::assert_single_stream(&messages)?;
    if messages.is_empty() {
        return Ok(vec![]);
    }

    const MAX_ATTEMPTS: usize = 5;
    let mut last_err = None;
    for _ in 0..MAX_ATTEMPTS {
        let current_seq: i64 = sqlx::query_scalar(
            "INSERT INTO streams (stream_id, seq) VALUES ($1, 0)
             ON CONFLICT (stream_id) DO UPDATE SET stream_id = EXCLUDED.stream_id
             RETURNING seq",
        )
        .bind(stream_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(pg_err)?;

        match append_to_stream_core(&mut *conn, stream_id, messages.clone(), Some(current_seq as u64)).await {
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

async fn schedule_messages_core(
    conn: &mut sqlx::PgConnection,
    messages: Vec<Message>,
    at: DateTime<Utc>,
) -> CoreResult<()> {
    for m in messages {
        sqlx::query(
            "INSERT INTO scheduled_messages (id, stream_id, type, causation_id, correlation_id, metadata, payload, created_at, available_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(m.id)
        .bind(&m.stream_id)
        .bind(&m.r#type)
        .bind(m.causation_id)
        .bind(m.correlation_id)
        .bind(&m.metadata)
        .bind(&m.payload)
        .bind(m.created_at)
        .bind(at)
        .execute(&mut *conn)
        .await
        .map_err(pg_err)?;
    }
    Ok(())
}

/// Delete the due `scheduled_messages` rows and append them to their
/// target streams in one go; the caller's transaction is what makes
/// this atomic, so a mid-loop append failure leaves the delete
/// uncommitted too (fixes the lost-message window described in
/// DESIGN.md's schedule-atomicity decision).
async fn update_schedule_core(conn: &mut sqlx::PgConnection) -> CoreResult<usize> {
    let rows: Vec<ScheduledRow> = sqlx::query_as(
        "SELECT id, stream_id, type, causation_id, correlation_id, metadata, payload, created_at
         FROM scheduled_messages
         WHERE available_at <= now()
         FOR UPDATE SKIP LOCKED",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(pg_err)?;

    if rows.is_empty() {
        return Ok(0);
    }

    let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
    sqlx::query("DELETE FROM scheduled_messages WHERE id = ANY($1)")
        .bind(&ids)
        .execute(&mut *conn)
        .await
        .map_err(pg_err)?;

    let promoted_at = Utc::now();
    let mut by_stream: std::collections::BTreeMap<String, Vec<Message>> = std::collections::BTreeMap::new();
    for row in rows {
        by_stream
            .entry(row.stream_id.clone())
            .or_default()
            .push(row.into_message(promoted_at));
    }

    let mut promoted = 0usize;
    for (stream_id, msgs) in by_stream {
        let n = msgs.len();
        append_next_to_stream_core(&mut *conn, &stream_id, msgs).await?;
        promoted += n;
    }
    Ok(promoted)
}

/// `ack`'s SQL: row-lock the offset first so a worker that no longer
/// holds the claim gets `ConcurrentAck` instead of silently stealing
/// another worker's progress.
async fn ack_core(
    conn: &mut sqlx::PgConnection,
    group_id: &str,
    stream_id: &str,
    global_seq: u64,
    worker_id: &str,
) -> CoreResult<()> {
    let existing: Option<ClaimRow> = sqlx::query_as(
        "SELECT claimed, claimed_by FROM offsets WHERE group_id = $1 AND stream_id = $2 FOR UPDATE",
    )
    .bind(group_id)
    .bind(stream_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(pg_err)?;

    if let Some(row) = existing {
        if row.claimed {
            if let Some(owner) = row.claimed_by {
                if owner != worker_id {
                    return Err(CoreError::ConcurrentAck {
                        group_id: group_id.to_string(),
                        stream_id: stream_id.to_string(),
                    });
                }
            }
        }
    }

    sqlx::query(
        "UPDATE offsets SET global_seq = GREATEST(global_seq, $1), claimed = false, claimed_at = NULL, claimed_by = NULL, claim_expires_at = NULL
         WHERE group_id = $2 AND stream_id = $3",
    )
    .bind(global_seq as i64)
    .bind(group_id)
    .bind(stream_id)
    .execute(&mut *conn)
    .await
    .map_err(pg_err)?;

    sqlx::query(
        "UPDATE consumer_groups SET highest_global_seq = GREATEST(highest_global_seq, $1), updated_at = now()
         WHERE group_id = $2",
    )
    .bind(global_seq as i64)
    .bind(group_id)
    .execute(&mut *conn)
    .await
    .map_err(pg_err)?;

    Ok(())
}
