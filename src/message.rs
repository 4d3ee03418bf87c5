//! The message envelope (C1).
//!
//! A [`Message`] is the immutable unit of the log. Concrete commands and
//! events are plain `serde_json::Value` payloads tagged with a `type`
//! string; the [`MessageRegistry`] maps those strings back to the Rust
//! types reactors expect when a batch is deserialized off the backend.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{CoreError, CoreResult};

/// Immutable envelope around a command or event payload.
///
/// Never mutated after construction: `correlate`/`follow`/`delay` all
/// return a modified copy, matching the append-only nature of the log
/// itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Unique id of this message, independent of its place in the log.
    pub id: Uuid,
    /// Stream this message belongs to (or will belong to, before append).
    pub stream_id: String,
    /// Registered type string, e.g. `"cart.AddItem"`.
    pub r#type: String,
    /// Sequence number within `stream_id`. `None` until the backend
    /// assigns one via `append_next_to_stream`.
    pub seq: Option<u64>,
    /// Monotonic position in the whole log. Assigned by the backend.
    pub global_seq: Option<u64>,
    /// Id of the message that directly caused this one.
    pub causation_id: Option<Uuid>,
    /// Id of the first message in this causal chain.
    pub correlation_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Construct a fresh message. `correlation_id` and `causation_id`
    /// default to `id` per §4.1.
    pub fn new(stream_id: impl Into<String>, r#type: impl Into<String>, payload: serde_json::Value) -> Self {
        let id = Uuid::now_v7();
        Self {
            id,
            stream_id: stream_id.into(),
            r#type: r#type.into(),
            seq: None,
            global_seq: None,
            causation_id: Some(id),
            correlation_id: Some(id),
            metadata: serde_json::json!({}),
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    /// Whether this message is a stored one (has been through an append).
    pub fn is_persisted(&self) -> bool {
        self.global_seq.is_some()
    }

    /// Copy `self`'s identity onto `other`: `other.causation_id` becomes
    /// `self.id`, `other.correlation_id` becomes `self.correlation_id`,
    /// and metadata is merged (​`other`'s keys win on conflict).
    pub fn correlate(&self, mut other: Message) -> Message {
        other.causation_id = Some(self.id);
        other.correlation_id = Some(self.correlation_id.unwrap_or(self.id));
        other.metadata = merge_metadata(&self.metadata, &other.metadata);
        other
    }

    /// Build a brand-new message that follows from `self`: same as
    /// `correlate` but the payload/type are freshly supplied rather than
    /// an existing `Message` value.
    pub fn follow(&self, stream_id: impl Into<String>, r#type: impl Into<String>, payload: serde_json::Value) -> Message {
        let next = Message::new(stream_id, r#type, payload);
        self.correlate(next)
    }

    /// Return a copy scheduled to appear at `at`. Rejects `at` earlier
    /// than this message's own `created_at` (§4.1, §7 `PastMessageDate`).
    pub fn delay(&self, at: DateTime<Utc>) -> CoreResult<Message> {
        if at < self.created_at {
            return Err(CoreError::PastMessageDate {
                requested: at,
                original: self.created_at,
            });
        }
        let mut copy = self.clone();
        copy.created_at = at;
        Ok(copy)
    }
}

fn merge_metadata(base: &serde_json::Value, overlay: &serde_json::Value) -> serde_json::Value {
    match (base, overlay) {
        (serde_json::Value::Object(b), serde_json::Value::Object(o)) => {
            let mut merged = b.clone();
            for (k, v) in o {
                merged.insert(k.clone(), v.clone());
            }
            serde_json::Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}

/// A replaying-aware batch entry handed to a reactor's `handle_batch`.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub message: Message,
    /// `true` when `message.global_seq <= group.highest_global_seq`,
    /// i.e. the group has already acknowledged past this point once
    /// before and is now replaying (GLOSSARY: Replaying).
    pub replaying: bool,
}

/// Factory function that turns a stored JSON payload back into a
/// concrete Rust value, boxed as `Any` so the registry can be
/// non-generic. Reactors downcast after lookup.
pub type MessageFactory = Arc<dyn Fn(&serde_json::Value) -> CoreResult<()> + Send + Sync>;

/// Maps a registered type string to the reactors interested in it and
/// validates that every stored `type` is known before dispatch.
///
/// This is deliberately minimal: callers only need unknown types to be
/// detectable (`UnknownMessage`), not deserialization performed
/// generically — reactors own their own `serde_json::from_value`
/// calls on the payload they expect.
#[derive(Debug, Clone, Default)]
pub struct MessageRegistry {
    known_types: HashMap<String, ()>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_name: impl Into<String>) {
        self.known_types.insert(type_name.into(), ());
    }

    pub fn is_known(&self, type_name: &str) -> bool {
        self.known_types.contains_key(type_name)
    }

    pub fn require_known(&self, type_name: &str) -> CoreResult<()> {
        if self.is_known(type_name) {
            Ok(())
        } else {
            Err(CoreError::UnknownMessage(type_name.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_defaults_correlation_to_self() {
        let m = Message::new("c1", "cart.AddItem", serde_json::json!({"sku": "A"}));
        assert_eq!(m.correlation_id, Some(m.id));
        assert_eq!(m.causation_id, Some(m.id));
    }

    #[test]
    fn correlate_copies_causation_and_correlation() {
        let source = Message::new("c1", "cart.AddItem", serde_json::json!({}));
        let follow_up = Message::new("c1", "cart.ItemAdded", serde_json::json!({}));
        let correlated = source.correlate(follow_up);

        assert_eq!(correlated.causation_id, Some(source.id));
        assert_eq!(correlated.correlation_id, source.correlation_id);
    }

    #[test]
    fn follow_builds_and_correlates_in_one_step() {
        let source = Message::new("c1", "cart.AddItem", serde_json::json!({}));
        let reply = source.follow("c1", "cart.ItemAdded", serde_json::json!({"sku": "A"}));

        assert_eq!(reply.causation_id, Some(source.id));
        assert_eq!(reply.correlation_id, source.correlation_id);
        assert_ne!(reply.id, source.id);
    }

    #[test]
    fn delay_rejects_earlier_than_original() {
        let m = Message::new("c1", "cart.AddItem", serde_json::json!({}));
        let earlier = m.created_at - chrono::Duration::seconds(10);
        assert!(m.delay(earlier).is_err());
    }

    #[test]
    fn delay_accepts_later_timestamp() {
        let m = Message::new("c1", "cart.AddItem", serde_json::json!({}));
        let later = m.created_at + chrono::Duration::seconds(10);
        let delayed = m.delay(later).unwrap();
        assert_eq!(delayed.created_at, later);
    }

    #[test]
    fn metadata_merge_prefers_overlay_keys() {
        let source = Message::new("c1", "cart.AddItem", serde_json::json!({}))
            .with_metadata(serde_json::json!({"a": 1, "b": 1}));
        let follow_up = Message::new("c1", "cart.ItemAdded", serde_json::json!({}))
            .with_metadata(serde_json::json!({"b": 2}));
        let merged = source.correlate(follow_up);
        assert_eq!(merged.metadata, serde_json::json!({"a": 1, "b": 2}));
    }

    #[test]
    fn registry_flags_unknown_types() {
        let mut reg = MessageRegistry::new();
        reg.register("cart.AddItem");
        assert!(reg.require_known("cart.AddItem").is_ok());
        assert!(reg.require_known("cart.Unknown").is_err());
    }
}
