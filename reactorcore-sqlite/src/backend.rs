//! `Backend` implementation over SQLite. The pool is pinned to a single
//! connection (see [`crate::pool`]), so every operation here is already
//! serialized by the pool's own connection-acquire queue; SQL
//! transactions exist for atomicity of multi-statement operations, not
//! for concurrency control the way `SELECT ... FOR UPDATE SKIP LOCKED`
//! provides in `reactorcore-postgres`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use uuid::Uuid;

use reactorcore::backend::{
    Backend, ClaimedBatch, ConsumerGroupStats, GroupStatus, GroupUpdater, OffsetInfo, StartFrom, Transaction,
    TransactionBlock,
};
use reactorcore::errors::{CoreError, CoreResult};
use reactorcore::message::{BatchEntry, Message};

use crate::error::SqliteError;
use crate::notifier::NotifyBus;

pub struct SqliteBackend {
    pool: SqlitePool,
    claim_ttl_seconds: i64,
    notify_bus: NotifyBus,
}

impl SqliteBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            claim_ttl_seconds: 120,
            notify_bus: NotifyBus::new(),
        }
    }

    pub fn with_claim_ttl_seconds(mut self, seconds: i64) -> Self {
        self.claim_ttl_seconds = seconds;
        self
    }

    /// Hand out a receiver for newly appended message types, for
    /// [`crate::notifier::InProcessNotificationSource`] to subscribe to.
    pub fn notify_bus(&self) -> NotifyBus {
        self.notify_bus.clone()
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    stream_id: String,
    seq: i64,
    global_seq: i64,
    r#type: String,
    causation_id: Option<String>,
    correlation_id: Option<String>,
    metadata: String,
    payload: String,
    created_at: String,
}

fn parse_uuid(s: &str) -> CoreResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| CoreError::InvalidMessage(format!("invalid uuid {s}: {e}")))
}

fn parse_time(s: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::InvalidMessage(format!("invalid timestamp {s}: {e}")))
}

impl MessageRow {
    fn into_message(self) -> CoreResult<Message> {
        Ok(Message {
            id: parse_uuid(&self.id)?,
            stream_id: self.stream_id,
            r#type: self.r#type,
            seq: Some(self.seq as u64),
            global_seq: Some(self.global_seq as u64),
            causation_id: self.causation_id.as_deref().map(parse_uuid).transpose()?,
            correlation_id: self.correlation_id.as_deref().map(parse_uuid).transpose()?,
            metadata: serde_json::from_str(&self.metadata)
                .map_err(|e| CoreError::InvalidMessage(e.to_string()))?,
            payload: serde_json::from_str(&self.payload)
                .map_err(|e| CoreError::InvalidMessage(e.to_string()))?,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ScheduledRow {
    id: String,
    stream_id: String,
    r#type: String,
    causation_id: Option<String>,
    correlation_id: Option<String>,
    metadata: String,
    payload: String,
}

impl ScheduledRow {
    fn into_message(self, promoted_at: DateTime<Utc>) -> CoreResult<Message> {
        Ok(Message {
            id: parse_uuid(&self.id)?,
            stream_id: self.stream_id,
            r#type: self.r#type,
            seq: None,
            global_seq: None,
            causation_id: self.causation_id.as_deref().map(parse_uuid).transpose()?,
            correlation_id: self.correlation_id.as_deref().map(parse_uuid).transpose()?,
            metadata: serde_json::from_str(&self.metadata)
                .map_err(|e| CoreError::InvalidMessage(e.to_string()))?,
            payload: serde_json::from_str(&self.payload)
                .map_err(|e| CoreError::InvalidMessage(e.to_string()))?,
            created_at: promoted_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OffsetRow {
    group_id: String,
    stream_id: String,
    global_seq: i64,
    claimed: bool,
    claimed_at: Option<String>,
    claimed_by: Option<String>,
}

impl OffsetRow {
    fn into_offset_info(self) -> CoreResult<OffsetInfo> {
        Ok(OffsetInfo {
            group_id: self.group_id,
            stream_id: self.stream_id,
            global_seq: self.global_seq as u64,
            claimed: self.claimed,
            claimed_at: self.claimed_at.as_deref().map(parse_time).transpose()?,
            claimed_by: self.claimed_by,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConsumerGroupRow {
    group_id: String,
    status: String,
    highest_global_seq: i64,
    retry_at: Option<String>,
    error_context: String,
}

impl ConsumerGroupRow {
    fn status(&self) -> GroupStatus {
        if self.status == "stopped" {
            GroupStatus::Stopped
        } else {
            GroupStatus::Active
        }
    }

    fn retry_at(&self) -> CoreResult<Option<DateTime<Utc>>> {
        self.retry_at.as_deref().map(parse_time).transpose()
    }

    fn error_context(&self) -> Value {
        serde_json::from_str(&self.error_context).unwrap_or(Value::Null)
    }
}

#[derive(sqlx::FromRow)]
struct ClaimRow {
    claimed: bool,
    claimed_by: Option<String>,
}

fn sqlite_err(e: sqlx::Error) -> CoreError {
    SqliteError::from(e).into()
}

fn append_err(e: sqlx::Error, stream_id: &str, seq: u64) -> CoreError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() {
            return CoreError::ConcurrentAppend {
                stream_id: stream_id.to_string(),
                seq,
            };
        }
    }
    sqlite_err(e)
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn install(&self) -> CoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CoreError::Backend(SqliteError::from(e).to_string()))?;
        Ok(())
    }

    async fn append_to_stream(
        &self,
        stream_id: &str,
        messages: Vec<Message>,
        expected_seq: Option<u64>,
    ) -> CoreResult<Vec<Message>> {
        let mut tx = self.pool.begin().await.map_err(sqlite_err)?;
        let written = append_to_stream_core(&mut tx, stream_id, messages, expected_seq).await?;
        tx.commit().await.map_err(sqlite_err)?;

        for m in &written {
            self.notify_bus.publish(m.r#type.clone());
        }
        Ok(written)
    }

    async fn append_next_to_stream(&self, stream_id: &str, messages: Vec<Message>) -> CoreResult<Vec<Message>> {
        let mut tx = self.pool.begin().await.map_err(sqlite_err)?;
        let written = append_next_to_stream_core(&mut tx, stream_id, messages).await?;
        tx.commit().await.map_err(sqlite_err)?;

        for m in &written {
            self.notify_bus.publish(m.r#type.clone());
        }
        Ok(written)
    }

    async fn schedule_messages(&self, messages: Vec<Message>, at: DateTime<Utc>) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(sqlite_err)?;
        schedule_messages_core(&mut tx, messages, at).await?;
        tx.commit().await.map_err(sqlite_err)?;
        Ok(())
    }

    async fn update_schedule(&self) -> CoreResult<usize> {
        // Delete the due rows and append them in the same transaction
        // (§4.7, DESIGN.md's schedule-atomicity decision): a failed
        // append leaves the scheduled row in place instead of losing it.
        let mut tx = self.pool.begin().await.map_err(sqlite_err)?;
        let promoted = update_schedule_core(&mut tx).await?;
        tx.commit().await.map_err(sqlite_err)?;
        Ok(promoted)
    }

    async fn register_consumer_group(&self, group_id: &str, start_from: StartFrom) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(sqlite_err)?;

        let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM consumer_groups WHERE group_id = ?")
            .bind(group_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlite_err)?;
        if existing.is_some() {
            tx.commit().await.map_err(sqlite_err)?;
            return Ok(());
        }

        let start_global_seq: i64 = match start_from {
            StartFrom::Beginning => 0,
            StartFrom::AtSeq(n) => n as i64,
            StartFrom::Now => sqlx::query_scalar("SELECT COALESCE(MAX(global_seq), 0) FROM messages")
                .fetch_one(&mut *tx)
                .await
                .map_err(sqlite_err)?,
            StartFrom::At(at) => sqlx::query_scalar("SELECT COALESCE(MAX(global_seq), 0) FROM messages WHERE created_at <= ?")
                .bind(at.to_rfc3339())
                .fetch_one(&mut *tx)
                .await
                .map_err(sqlite_err)?,
        };

        sqlx::query("INSERT INTO consumer_groups (group_id, status, start_global_seq) VALUES (?, 'active', ?)")
            .bind(group_id)
            .bind(start_global_seq)
            .execute(&mut *tx)
            .await
            .map_err(sqlite_err)?;

        tx.commit().await.map_err(sqlite_err)?;
        Ok(())
    }

    async fn start_consumer_group(&self, group_id: &str) -> CoreResult<()> {
        sqlx::query(
            "UPDATE consumer_groups SET status = 'active', retry_at = NULL, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE group_id = ?",
        )
        .bind(group_id)
        .execute(&self.pool)
        .await
        .map_err(sqlite_err)?;
        Ok(())
    }

    async fn stop_consumer_group(&self, group_id: &str, reason: &str) -> CoreResult<()> {
        sqlx::query(
            "UPDATE consumer_groups SET status = 'stopped', error_context = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE group_id = ?",
        )
        .bind(serde_json::json!({"reason": reason}).to_string())
        .bind(group_id)
        .execute(&self.pool)
        .await
        .map_err(sqlite_err)?;
        Ok(())
    }

    async fn reset_consumer_group(&self, group_id: &str) -> CoreResult<()> {
        sqlx::query("DELETE FROM offsets WHERE group_id = ?")
            .bind(group_id)
            .execute(&self.pool)
            .await
            .map_err(sqlite_err)?;
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
        let mut tx = self.pool.begin().await.map_err(sqlite_err)?;

        let group: Option<ConsumerGroupRow> = sqlx::query_as(
            "SELECT group_id, status, highest_global_seq, retry_at, error_context FROM consumer_groups WHERE group_id = ?",
        )
        .bind(group_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(sqlite_err)?;

        let Some(group) = group else {
            tx.commit().await.ok();
            return Ok(None);
        };
        if group.status() == GroupStatus::Stopped {
            tx.commit().await.ok();
            return Ok(None);
        }
        if let Some(retry_at) = group.retry_at()? {
            if retry_at > Utc::now() {
                tx.commit().await.ok();
                return Ok(None);
            }
        }

        let start_global_seq: i64 = sqlx::query_scalar("SELECT start_global_seq FROM consumer_groups WHERE group_id = ?")
            .bind(group_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(sqlite_err)?;

        let all_messages: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, stream_id, seq, global_seq, type, causation_id, correlation_id, metadata, payload, created_at
             FROM messages ORDER BY global_seq",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(sqlite_err)?;

        let mut stream_ids: Vec<String> = all_messages
            .iter()
            .filter(|m| handled_types.contains(&m.r#type))
            .map(|m| m.stream_id.clone())
            .collect();
        stream_ids.sort();
        stream_ids.dedup();

        let existing_offsets: Vec<OffsetRow> = sqlx::query_as(
            "SELECT group_id, stream_id, global_seq, claimed, claimed_at, claimed_by FROM offsets WHERE group_id = ?",
        )
        .bind(group_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(sqlite_err)?;
        let mut offset_by_stream: std::collections::HashMap<String, OffsetRow> =
            existing_offsets.into_iter().map(|o| (o.stream_id.clone(), o)).collect();

        for stream_id in stream_ids {
            if let Some(existing) = offset_by_stream.get(&stream_id) {
                if existing.claimed {
                    continue;
                }
            }
            let offset_global_seq = offset_by_stream
                .get(&stream_id)
                .map(|o| o.global_seq)
                .unwrap_or(start_global_seq);

            let mut candidates: Vec<&MessageRow> = all_messages
                .iter()
                .filter(|m| m.stream_id == stream_id && handled_types.contains(&m.r#type) && m.global_seq > offset_global_seq)
                .collect();
            candidates.sort_by_key(|m| m.global_seq);
            candidates.truncate(batch_size.max(1));

            if candidates.is_empty() {
                continue;
            }

            sqlx::query(
                "INSERT INTO offsets (group_id, stream_id, global_seq) VALUES (?, ?, ?)
                 ON CONFLICT (group_id, stream_id) DO NOTHING",
            )
            .bind(group_id)
            .bind(&stream_id)
            .bind(offset_global_seq)
            .execute(&mut *tx)
            .await
            .map_err(sqlite_err)?;

            let expires_at = Utc::now() + chrono::Duration::seconds(self.claim_ttl_seconds);
            sqlx::query(
                "UPDATE offsets SET claimed = 1, claimed_at = ?, claimed_by = ?, claim_expires_at = ?
                 WHERE group_id = ? AND stream_id = ?",
            )
            .bind(Utc::now().to_rfc3339())
            .bind(worker_id)
            .bind(expires_at.to_rfc3339())
            .bind(group_id)
            .bind(&stream_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlite_err)?;

            let offset: OffsetRow = sqlx::query_as(
                "SELECT group_id, stream_id, global_seq, claimed, claimed_at, claimed_by FROM offsets
                 WHERE group_id = ? AND stream_id = ?",
            )
            .bind(group_id)
            .bind(&stream_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(sqlite_err)?;

            let highest = group.highest_global_seq;
            let batch: Vec<BatchEntry> = candidates
                .into_iter()
                .map(|row| {
                    let message = MessageRow {
                        id: row.id.clone(),
                        stream_id: row.stream_id.clone(),
                        seq: row.seq,
                        global_seq: row.global_seq,
                        r#type: row.r#type.clone(),
                        causation_id: row.causation_id.clone(),
                        correlation_id: row.correlation_id.clone(),
                        metadata: row.metadata.clone(),
                        payload: row.payload.clone(),
                        created_at: row.created_at.clone(),
                    }
                    .into_message()?;
                    let replaying = message.global_seq.unwrap_or(0) as i64 <= highest;
                    Ok(BatchEntry { message, replaying })
                })
                .collect::<CoreResult<Vec<_>>>()?;

            let history = if with_history {
                let mut h: Vec<Message> = Vec::new();
                for row in all_messages.iter().filter(|m| m.stream_id == stream_id) {
                    h.push(
                        MessageRow {
                            id: row.id.clone(),
                            stream_id: row.stream_id.clone(),
                            seq: row.seq,
                            global_seq: row.global_seq,
                            r#type: row.r#type.clone(),
                            causation_id: row.causation_id.clone(),
                            correlation_id: row.correlation_id.clone(),
                            metadata: row.metadata.clone(),
                            payload: row.payload.clone(),
                            created_at: row.created_at.clone(),
                        }
                        .into_message()?,
                    );
                }
                h.sort_by_key(|m| m.seq.unwrap_or(0));
                Some(h)
            } else {
                None
            };

            tx.commit().await.map_err(sqlite_err)?;

            return Ok(Some(ClaimedBatch {
                offset: offset.into_offset_info()?,
                batch,
                history,
            }));
        }

        tx.commit().await.map_err(sqlite_err)?;
        Ok(None)
    }

    async fn ack(&self, group_id: &str, stream_id: &str, global_seq: u64, worker_id: &str) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(sqlite_err)?;
        ack_core(&mut tx, group_id, stream_id, global_seq, worker_id).await?;
        tx.commit().await.map_err(sqlite_err)?;
        Ok(())
    }

    async fn transaction(&self, block: TransactionBlock) -> CoreResult<()> {
        let tx = self.pool.begin().await.map_err(sqlite_err)?;
        let wrapper = SqliteTransaction { inner: Mutex::new(tx) };
        let result = block(&wrapper).await;
        let inner = wrapper.inner.into_inner();
        match result {
            Ok(()) => {
                inner.commit().await.map_err(sqlite_err)?;
                Ok(())
            }
            Err(e) => {
                inner.rollback().await.ok();
                Err(e)
            }
        }
    }

    async fn release_claim(&self, group_id: &str, stream_id: &str) -> CoreResult<()> {
        sqlx::query(
            "UPDATE offsets SET claimed = 0, claimed_at = NULL, claimed_by = NULL, claim_expires_at = NULL
             WHERE group_id = ? AND stream_id = ?",
        )
        .bind(group_id)
        .bind(stream_id)
        .execute(&self.pool)
        .await
        .map_err(sqlite_err)?;
        Ok(())
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

        let mut updater = RecordingUpdater {
            stopped: None,
            retried: None,
        };
        mutate(&mut updater);

        let mut tx = self.pool.begin().await.map_err(sqlite_err)?;

        if let Some(reason) = updater.stopped {
            sqlx::query(
                "UPDATE consumer_groups SET status = 'stopped', error_context = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE group_id = ?",
            )
            .bind(serde_json::json!({"reason": reason}).to_string())
            .bind(group_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlite_err)?;
        }
        if let Some((at, ctx)) = updater.retried {
            sqlx::query(
                "UPDATE consumer_groups SET retry_at = ?, error_context = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE group_id = ?",
            )
            .bind(at.to_rfc3339())
            .bind(ctx.to_string())
            .bind(group_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlite_err)?;
        }

        tx.commit().await.map_err(sqlite_err)?;
        Ok(())
    }

    async fn read_stream(&self, stream_id: &str, upto_seq: Option<u64>) -> CoreResult<Vec<Message>> {
        let rows: Vec<MessageRow> = match upto_seq {
            Some(cap) => sqlx::query_as(
                "SELECT id, stream_id, seq, global_seq, type, causation_id, correlation_id, metadata, payload, created_at
                 FROM messages WHERE stream_id = ? AND seq <= ? ORDER BY seq",
            )
            .bind(stream_id)
            .bind(cap as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlite_err)?,
            None => sqlx::query_as(
                "SELECT id, stream_id, seq, global_seq, type, causation_id, correlation_id, metadata, payload, created_at
                 FROM messages WHERE stream_id = ? ORDER BY seq",
            )
            .bind(stream_id)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlite_err)?,
        };
        rows.into_iter().map(|r| r.into_message()).collect()
    }

    async fn read_correlation_batch(&self, message_id: Uuid) -> CoreResult<Vec<Message>> {
        let correlation_id: Option<String> = sqlx::query_scalar(
            "SELECT COALESCE(correlation_id, id) FROM messages WHERE id = ?",
        )
        .bind(message_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlite_err)?;

        let Some(correlation_id) = correlation_id else {
            return Ok(vec![]);
        };

        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, stream_id, seq, global_seq, type, causation_id, correlation_id, metadata, payload, created_at
             FROM messages WHERE correlation_id = ? ORDER BY global_seq",
        )
        .bind(&correlation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlite_err)?;
        rows.into_iter().map(|r| r.into_message()).collect()
    }

    async fn worker_heartbeat(&self, worker_ids: &[String]) -> CoreResult<()> {
        for id in worker_ids {
            sqlx::query(
                "INSERT INTO workers (worker_id, last_heartbeat_at) VALUES (?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                 ON CONFLICT (worker_id) DO UPDATE SET last_heartbeat_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
            )
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sqlite_err)?;
        }
        Ok(())
    }

    async fn release_stale_claims(&self, ttl_seconds: i64) -> CoreResult<usize> {
        let _ = ttl_seconds; // claim_expires_at was computed at claim time using self.claim_ttl_seconds.
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE offsets SET claimed = 0, claimed_at = NULL, claimed_by = NULL, claim_expires_at = NULL
             WHERE claimed AND claim_expires_at <= ?",
        )
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(sqlite_err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn stats(&self) -> CoreResult<Vec<ConsumerGroupStats>> {
        let rows: Vec<ConsumerGroupRow> = sqlx::query_as(
            "SELECT group_id, status, highest_global_seq, retry_at, error_context FROM consumer_groups",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(sqlite_err)?;

        rows.into_iter()
            .map(|r| {
                Ok(ConsumerGroupStats {
                    group_id: r.group_id.clone(),
                    status: r.status(),
                    highest_global_seq: r.highest_global_seq as u64,
                    retry_at: r.retry_at()?,
                    error_context: r.error_context(),
                })
            })
            .collect()
    }
}

/// A [`Transaction`] handle sharing one `sqlx` transaction across every
/// call made through it, guarded by a `tokio::sync::Mutex` since the
/// trait's methods take `&self` but `sqlx::Transaction` needs `&mut`
/// access.
struct SqliteTransaction<'c> {
    inner: Mutex<sqlx::Transaction<'c, sqlx::Sqlite>>,
}

#[async_trait]
impl Transaction for SqliteTransaction<'_> {
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

async fn append_to_stream_core(
    conn: &mut sqlx::SqliteConnection,
    stream_id: &str,
    messages: Vec<Message>,
    expected_seq: Option<u64>,
) -> CoreResult<Vec<Message>> {
    reactorcore::actions::assert_single_stream(&messages)?;
    if messages.is_empty() {
        return Ok(vec![]);
    }

    sqlx::query("INSERT OR IGNORE INTO streams (stream_id, seq) VALUES (?, 0)")
        .bind(stream_id)
        .execute(&mut *conn)
        .await
        .map_err(sqlite_err)?;

    let current_seq: i64 = sqlx::query_scalar("SELECT seq FROM streams WHERE stream_id = ?")
        .bind(stream_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(sqlite_err)?;

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
        let global_seq: i64 = sqlx::query_scalar(
            "UPDATE global_seq_counter SET next_value = next_value + 1 WHERE id = 1 RETURNING next_value - 1",
        )
        .fetch_one(&mut *conn)
        .await
        .map_err(sqlite_err)?;

        let metadata = serde_json::to_string(&m.metadata).map_err(|e| CoreError::InvalidMessage(e.to_string()))?;
        let payload = serde_json::to_string(&m.payload).map_err(|e| CoreError::InvalidMessage(e.to_string()))?;

        sqlx::query(
            "INSERT INTO messages (id, stream_id, seq, global_seq, type, causation_id, correlation_id, metadata, payload, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(m.id.to_string())
        .bind(stream_id)
        .bind(seq)
        .bind(global_seq)
        .bind(&m.r#type)
        .bind(m.causation_id.map(|u| u.to_string()))
        .bind(m.correlation_id.map(|u| u.to_string()))
        .bind(&metadata)
        .bind(&payload)
        .bind(m.created_at.to_rfc3339())
        .execute(&mut *conn)
        .await
        .map_err(|e| append_err(e, stream_id, seq as u64))?;

        written.push(Message {
            seq: Some(seq as u64),
            global_seq: Some(global_seq as u64),
            ..m
        });
    }

    sqlx::query("UPDATE streams SET seq = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE stream_id = ?")
        .bind(seq)
        .bind(stream_id)
        .execute(&mut *conn)
        .await
        .map_err(sqlite_err)?;

    Ok(written)
}

async fn append_next_to_stream_core(
    conn: &mut sqlx::SqliteConnection,
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
        sqlx::query("INSERT OR IGNORE INTO streams (stream_id, seq) VALUES (?, 0)")
            .bind(stream_id)
            .execute(&mut *conn)
            .await
            .map_err(sqlite_err)?;
        let current_seq: i64 = sqlx::query_scalar("SELECT seq FROM streams WHERE stream_id = ?")
            .bind(stream_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(sqlite_err)?;

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
    conn: &mut sqlx::SqliteConnection,
    messages: Vec<Message>,
    at: DateTime<Utc>,
) -> CoreResult<()> {
    for m in messages {
        let metadata = serde_json::to_string(&m.metadata).map_err(|e| CoreError::InvalidMessage(e.to_string()))?;
        let payload = serde_json::to_string(&m.payload).map_err(|e| CoreError::InvalidMessage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO scheduled_messages (id, stream_id, type, causation_id, correlation_id, metadata, payload, created_at, available_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(m.id.to_string())
        .bind(&m.stream_id)
        .bind(&m.r#type)
        .bind(m.causation_id.map(|u| u.to_string()))
        .bind(m.correlation_id.map(|u| u.to_string()))
        .bind(&metadata)
        .bind(&payload)
        .bind(m.created_at.to_rfc3339())
        .bind(at.to_rfc3339())
        .execute(&mut *conn)
        .await
        .map_err(sqlite_err)?;
    }
    Ok(())
}

/// Deletes the due `scheduled_messages` rows and appends them to their
/// target streams on the same connection the caller's transaction owns,
/// so a mid-loop append failure leaves the delete uncommitted too.
async fn update_schedule_core(conn: &mut sqlx::SqliteConnection) -> CoreResult<usize> {
    let now = Utc::now().to_rfc3339();
    let rows: Vec<ScheduledRow> = sqlx::query_as(
        "SELECT id, stream_id, type, causation_id, correlation_id, metadata, payload
         FROM scheduled_messages WHERE available_at <= ?",
    )
    .bind(&now)
    .fetch_all(&mut *conn)
    .await
    .map_err(sqlite_err)?;

    if rows.is_empty() {
        return Ok(0);
    }

    let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
    for id in &ids {
        sqlx::query("DELETE FROM scheduled_messages WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(sqlite_err)?;
    }

    let promoted_at = Utc::now();
    let mut by_stream: std::collections::BTreeMap<String, Vec<Message>> = std::collections::BTreeMap::new();
    for row in rows {
        let stream_id = row.stream_id.clone();
        by_stream.entry(stream_id).or_default().push(row.into_message(promoted_at)?);
    }

    let mut promoted = 0usize;
    for (stream_id, msgs) in by_stream {
        let n = msgs.len();
        append_next_to_stream_core(&mut *conn, &stream_id, msgs).await?;
        promoted += n;
    }
    Ok(promoted)
}

/// `ack`'s mutation: the single-connection pool already serializes every
/// call, so a plain read-then-check is enough to catch a worker acking a
/// claim it no longer holds.
async fn ack_core(
    conn: &mut sqlx::SqliteConnection,
    group_id: &str,
    stream_id: &str,
    global_seq: u64,
    worker_id: &str,
) -> CoreResult<()> {
    let existing: Option<ClaimRow> = sqlx::query_as("SELECT claimed, claimed_by FROM offsets WHERE group_id = ? AND stream_id = ?")
        .bind(group_id)
        .bind(stream_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(sqlite_err)?;

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
        "INSERT INTO offsets (group_id, stream_id, global_seq) VALUES (?, ?, ?)
         ON CONFLICT (group_id, stream_id) DO UPDATE SET global_seq = MAX(global_seq, excluded.global_seq),
         claimed = 0, claimed_at = NULL, claimed_by = NULL, claim_expires_at = NULL",
    )
    .bind(group_id)
    .bind(stream_id)
    .bind(global_seq as i64)
    .execute(&mut *conn)
    .await
    .map_err(sqlite_err)?;

    sqlx::query(
        "UPDATE consumer_groups SET highest_global_seq = MAX(highest_global_seq, ?), updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE group_id = ?",
    )
    .bind(global_seq as i64)
    .bind(group_id)
    .execute(&mut *conn)
    .await
    .map_err(sqlite_err)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SqliteBackendConfig;
    use crate::pool::SqlitePoolHandle;

    async fn backend() -> SqliteBackend {
        let config = SqliteBackendConfig::in_memory();
        let pool = SqlitePoolHandle::connect(&config).await.unwrap();
        SqliteBackend::new(pool.pool().clone())
    }

    fn msg(stream: &str, ty: &str) -> Message {
        Message::new(stream, ty, serde_json::json!({}))
    }

    #[tokio::test]
    async fn append_assigns_monotonic_seq_and_global_seq() {
        let backend = backend().await;
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
        let backend = backend().await;
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
    async fn claim_then_ack_round_trips_offset() {
        let backend = backend().await;
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
    async fn ack_from_the_wrong_worker_is_rejected() {
        let backend = backend().await;
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
    async fn second_worker_cannot_claim_the_same_stream() {
        let backend = backend().await;
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
    async fn stopped_group_returns_no_work() {
        let backend = backend().await;
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

    #[tokio::test]
    async fn schedule_then_promote_moves_message_into_the_stream() {
        let backend = backend().await;
        let future_msg = msg("s1", "e.Scheduled");
        let past = Utc::now() - chrono::Duration::seconds(1);
        backend.schedule_messages(vec![future_msg], past).await.unwrap();

        let n = backend.update_schedule().await.unwrap();
        assert_eq!(n, 1);

        let stream = backend.read_stream("s1", None).await.unwrap();
        assert_eq!(stream.len(), 1);
        assert_eq!(stream[0].r#type, "e.Scheduled");
    }
}
