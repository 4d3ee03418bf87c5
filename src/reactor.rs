//! The reactor contract (C6): Actor, Projector, Reaction.
//!
//! Actor/Projector/Reaction are cast as *capabilities* rather than an
//! inheritance hierarchy: every reactor value implements [`Reactor`]
//! directly (`handled_messages`, `consumer_info`, `handle_batch`), and
//! the `family` it belongs to is informational only — the Router is
//! polymorphic over the trait, not over a closed enum of concrete
//! types, because the trait already is the closed contract (the three
//! families are conventions for how a `Reactor` impl is *used*, not
//! separate traits it must implement).

use async_trait::async_trait;

use crate::actions::ActionPair;
use crate::backend::StartFrom;
use crate::errors::CoreResult;
use crate::message::{BatchEntry, Message};

/// Which of the three user-facing families a reactor belongs to.
/// Informational — it does not change how the Router dispatches, only
/// how a reactor is expected to behave (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorFamily {
    /// Validates commands, computes new events from prior history.
    Actor,
    /// Evolves read-side state from events.
    Projector,
    /// Fires follow-up commands/events when specified events occur.
    Reaction,
}

/// Static subscription metadata for a reactor (§4.6
/// `consumer_info`).
#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub group_id: String,
    pub start_from: StartFrom,
    pub batch_size: Option<usize>,
}

impl ConsumerInfo {
    pub fn new(group_id: impl Into<String>, start_from: StartFrom) -> Self {
        Self {
            group_id: group_id.into(),
            start_from,
            batch_size: None,
        }
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = Some(n);
        self
    }
}

/// A user-extensible handler that turns a batch of messages into a set
/// of deferred [`ActionPair`]s (§4.6).
///
/// Implementors commonly hold a `Vec<(String, fn(...) -> ...)>`-style
/// registration table internally to route each `Message::type` to the
/// right command/event handler (DESIGN NOTES: "per-class DSL" recast
/// as explicit registration of `(MessageType, handler_fn)` pairs).
#[async_trait]
pub trait Reactor: Send + Sync {
    /// Stable name used for routing, logging, and as the WorkQueue key.
    fn name(&self) -> &str;

    fn family(&self) -> ReactorFamily;

    /// Message type strings this reactor reacts to.
    fn handled_messages(&self) -> Vec<String>;

    fn consumer_info(&self) -> ConsumerInfo;

    /// Whether the Router should fetch the reactor's *own* stream's
    /// full history alongside the batch (determined once at
    /// registration by introspecting whether the concrete
    /// implementation needs it — exposed here as an explicit flag
    /// rather than reflection, since Rust has no runtime parameter
    /// introspection).
    fn needs_history(&self) -> bool {
        false
    }

    /// Handle one claimed batch, returning an action pair per message
    /// that needs one. `history`, when requested via
    /// [`Reactor::needs_history`], is the full ordered stream history
    /// for the stream this batch came from.
    async fn handle_batch(
        &self,
        batch: Vec<BatchEntry>,
        history: Option<Vec<Message>>,
    ) -> CoreResult<Vec<ActionPair>>;
}

/// Helper for reactors that enforce "a message type cannot be
/// registered as both a command and a reaction on the same reactor"
/// (§4.6). Call from a reactor's constructor with its command and
/// reaction type lists.
pub fn assert_disjoint_commands_and_reactions(
    commands: &[String],
    reactions: &[String],
) -> Result<(), String> {
    for c in commands {
        if reactions.contains(c) {
            return Err(format!(
                "message type {c} is registered as both a command and a reaction"
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_check_passes_for_non_overlapping_types() {
        let commands = vec!["cart.AddItem".to_string()];
        let reactions = vec!["cart.ItemAdded".to_string()];
        assert!(assert_disjoint_commands_and_reactions(&commands, &reactions).is_ok());
    }

    #[test]
    fn disjoint_check_fails_on_overlap() {
        let commands = vec!["cart.AddItem".to_string()];
        let reactions = vec!["cart.AddItem".to_string()];
        assert!(assert_disjoint_commands_and_reactions(&commands, &reactions).is_err());
    }
}
