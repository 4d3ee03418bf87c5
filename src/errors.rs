//! Error taxonomy for the core runtime (§7).

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::message::Message;

/// Errors that can occur anywhere in the log, dispatch, and reactor
/// layers. Backend crates wrap their own driver errors (`sqlx::Error`,
/// ...) and convert into `CoreError::Backend` at the trait boundary.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Optimistic-concurrency violation on `(stream_id, seq)`.
    #[error("concurrent append to stream {stream_id} at seq {seq}")]
    ConcurrentAppend { stream_id: String, seq: u64 },

    /// Attempted to ACK a message whose stream is claimed by another
    /// worker in the same group.
    #[error("stream {stream_id} is claimed by another worker for group {group_id}")]
    ConcurrentAck { group_id: String, stream_id: String },

    /// A batch handed to a stream-scoped append mixed stream ids.
    #[error("batch contains messages for more than one stream: {0} and {1}")]
    DifferentStreamId(String, String),

    /// Deserialization found a `type` string with no registered class.
    #[error("unknown message type: {0}")]
    UnknownMessage(String),

    /// `delay(t)` was called with `t` earlier than the original
    /// `created_at`.
    #[error("delay target {requested} is before original created_at {original}")]
    PastMessageDate {
        requested: DateTime<Utc>,
        original: DateTime<Utc>,
    },

    /// Schema validation failed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// BFS/drain iterations exceeded the configured cap.
    #[error("exceeded maximum drain rounds ({0})")]
    InfiniteLoop(usize),

    /// Mid-batch handler failure; the prefix of pairs already produced
    /// is carried so already-processed sync writes still commit.
    #[error("partial batch failure on message {failing_message}: {source}")]
    PartialBatch {
        pairs_so_far: usize,
        failing_message: Uuid,
        #[source]
        source: Box<CoreError>,
    },

    /// A reactor's handler raised. Wrapped so the Router can route it
    /// through the consumer group's `ErrorStrategy` without losing the
    /// original error's `Display` text (stored for `error_context`).
    #[error("handler error: {0}")]
    Handler(String),

    /// Opaque backend-layer failure (connection loss, driver error).
    #[error("backend error: {0}")]
    Backend(String),

    /// Bad configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization of a payload or envelope.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Construct a [`CoreError::PartialBatch`], boxing `source` as the
    /// trait requires every variant to stay `Send + Sync + 'static`.
    pub fn partial_batch(pairs_so_far: usize, failing_message: &Message, source: CoreError) -> Self {
        CoreError::PartialBatch {
            pairs_so_far,
            failing_message: failing_message.id,
            source: Box::new(source),
        }
    }

    /// A short, stable label for `error_context.reason` (§4.11), akin
    /// to the Ruby original's `exception.class`.
    pub fn reason_label(&self) -> &'static str {
        match self {
            CoreError::ConcurrentAppend { .. } => "ConcurrentAppend",
            CoreError::ConcurrentAck { .. } => "ConcurrentAck",
            CoreError::DifferentStreamId(..) => "DifferentStreamId",
            CoreError::UnknownMessage(_) => "UnknownMessage",
            CoreError::PastMessageDate { .. } => "PastMessageDate",
            CoreError::InvalidMessage(_) => "InvalidMessage",
            CoreError::InfiniteLoop(_) => "InfiniteLoop",
            CoreError::PartialBatch { .. } => "PartialBatch",
            CoreError::Handler(_) => "HandlerError",
            CoreError::Backend(_) => "BackendError",
            CoreError::Config(_) => "ConfigError",
            CoreError::Serialization(_) => "SerializationError",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_label_is_stable_for_error_context() {
        let err = CoreError::ConcurrentAppend {
            stream_id: "s1".into(),
            seq: 4,
        };
        assert_eq!(err.reason_label(), "ConcurrentAppend");
    }

    #[test]
    fn partial_batch_preserves_inner_error() {
        let m = Message::new("c1", "cart.AddItem", serde_json::json!({}));
        let inner = CoreError::InvalidMessage("bad payload".into());
        let wrapped = CoreError::partial_batch(2, &m, inner);
        match wrapped {
            CoreError::PartialBatch {
                pairs_so_far,
                failing_message,
                ..
            } => {
                assert_eq!(pairs_so_far, 2);
                assert_eq!(failing_message, m.id);
            }
            _ => panic!("expected PartialBatch"),
        }
    }
}
