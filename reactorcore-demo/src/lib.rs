//! A worked scenario built on `reactorcore`: a `Cart` actor validates
//! `cart.AddItem`/`cart.Checkout` commands against its own stream
//! history and emits events; a `SendReceipt` reaction fires a follow-up
//! command whenever a cart is checked out (the two-reactor pipeline the
//! core spec's scenario walkthroughs describe, §8 scenario 1).

use std::sync::Mutex;

use async_trait::async_trait;
use reactorcore::backend::StartFrom;
use reactorcore::errors::CoreResult;
use reactorcore::message::{BatchEntry, Message};
use reactorcore::{Action, ActionPair, ConsumerInfo, Reactor, ReactorFamily};

pub mod types {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AddItem {
        pub sku: String,
        pub quantity: u32,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ItemAdded {
        pub sku: String,
        pub quantity: u32,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Checkout {
        pub email: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CheckedOut {
        pub email: String,
        pub item_count: u32,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SendReceiptCommand {
        pub email: String,
        pub item_count: u32,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ReceiptSent {
        pub email: String,
    }
}

use types::*;

pub const ADD_ITEM: &str = "cart.AddItem";
pub const ITEM_ADDED: &str = "cart.ItemAdded";
pub const CHECKOUT: &str = "cart.Checkout";
pub const CHECKED_OUT: &str = "cart.CheckedOut";
pub const SEND_RECEIPT: &str = "receipt.Send";
pub const RECEIPT_SENT: &str = "receipt.Sent";

/// Validates cart commands against the cart's own event history and
/// emits the corresponding event. A cart that has already checked out
/// rejects further `AddItem`/`Checkout` commands.
pub struct Cart;

impl Cart {
    pub fn new() -> Self {
        Self
    }

    fn item_count(history: &[Message]) -> u32 {
        history
            .iter()
            .filter(|m| m.r#type == ITEM_ADDED)
            .filter_map(|m| serde_json::from_value::<ItemAdded>(m.payload.clone()).ok())
            .map(|e| e.quantity)
            .sum()
    }

    fn already_checked_out(history: &[Message]) -> bool {
        history.iter().any(|m| m.r#type == CHECKED_OUT)
    }
}

impl Default for Cart {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reactor for Cart {
    fn name(&self) -> &str {
        "cart"
    }

    fn family(&self) -> ReactorFamily {
        ReactorFamily::Actor
    }

    fn handled_messages(&self) -> Vec<String> {
        vec![ADD_ITEM.to_string(), CHECKOUT.to_string()]
    }

    fn consumer_info(&self) -> ConsumerInfo {
        // Each `AppendAfter` pins `expected_seq` to its own command's
        // `seq`; a batch of more than one would let an earlier command's
        // append shift the tip out from under a later one's check.
        ConsumerInfo::new("cart", StartFrom::Beginning).with_batch_size(1)
    }

    fn needs_history(&self) -> bool {
        true
    }

    async fn handle_batch(
        &self,
        batch: Vec<BatchEntry>,
        history: Option<Vec<Message>>,
    ) -> CoreResult<Vec<ActionPair>> {
        let mut history = history.unwrap_or_default();
        let mut pairs = Vec::with_capacity(batch.len());

        for entry in batch {
            let message = entry.message;
            if Self::already_checked_out(&history) {
                pairs.push(ActionPair::ack_only(message));
                continue;
            }

            match message.r#type.as_str() {
                t if t == ADD_ITEM => {
                    let cmd: AddItem = serde_json::from_value(message.payload.clone())
                        .map_err(|e| reactorcore::CoreError::InvalidMessage(e.to_string()))?;
                    let event = message.follow(
                        &message.stream_id,
                        ITEM_ADDED,
                        serde_json::to_value(ItemAdded {
                            sku: cmd.sku,
                            quantity: cmd.quantity,
                        })
                        .unwrap(),
                    );
                    history.push(event.clone());
                    pairs.push(ActionPair::new(
                        message,
                        vec![Action::AppendAfter {
                            stream_id: event.stream_id.clone(),
                            messages: vec![event],
                        }],
                    ));
                }
                t if t == CHECKOUT => {
                    let cmd: Checkout = serde_json::from_value(message.payload.clone())
                        .map_err(|e| reactorcore::CoreError::InvalidMessage(e.to_string()))?;
                    let item_count = Self::item_count(&history);
                    let event = message.follow(
                        &message.stream_id,
                        CHECKED_OUT,
                        serde_json::to_value(CheckedOut {
                            email: cmd.email,
                            item_count,
                        })
                        .unwrap(),
                    );
                    history.push(event.clone());
                    pairs.push(ActionPair::new(
                        message,
                        vec![Action::AppendAfter {
                            stream_id: event.stream_id.clone(),
                            messages: vec![event],
                        }],
                    ));
                }
                _ => pairs.push(ActionPair::ack_only(message)),
            }
        }

        Ok(pairs)
    }
}

/// Fires a `receipt.Send` command to a dedicated `receipts` stream
/// whenever a cart checks out, demonstrating cross-stream causation
/// (§4.1 `correlate`/`follow`, §4.6 Reaction family).
pub struct SendReceipt;

impl SendReceipt {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SendReceipt {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reactor for SendReceipt {
    fn name(&self) -> &str {
        "send_receipt"
    }

    fn family(&self) -> ReactorFamily {
        ReactorFamily::Reaction
    }

    fn handled_messages(&self) -> Vec<String> {
        vec![CHECKED_OUT.to_string()]
    }

    fn consumer_info(&self) -> ConsumerInfo {
        ConsumerInfo::new("send_receipt", StartFrom::Beginning)
    }

    async fn handle_batch(
        &self,
        batch: Vec<BatchEntry>,
        _history: Option<Vec<Message>>,
    ) -> CoreResult<Vec<ActionPair>> {
        let mut pairs = Vec::with_capacity(batch.len());
        for entry in batch {
            let message = entry.message;
            let checked_out: CheckedOut = serde_json::from_value(message.payload.clone())
                .map_err(|e| reactorcore::CoreError::InvalidMessage(e.to_string()))?;

            let command = message.follow(
                "receipts",
                SEND_RECEIPT,
                serde_json::to_value(SendReceiptCommand {
                    email: checked_out.email,
                    item_count: checked_out.item_count,
                })
                .unwrap(),
            );

            pairs.push(ActionPair::new(
                message,
                vec![Action::AppendNext { messages: vec![command] }],
            ));
        }
        Ok(pairs)
    }
}

/// A trivial actor that turns `receipt.Send` into `receipt.Sent`,
/// recording deliveries in-process for the demo binary/tests to assert
/// against without a real mail transport.
pub struct ReceiptSender {
    sent: Mutex<Vec<String>>,
}

impl ReceiptSender {
    pub fn new() -> Self {
        Self { sent: Mutex::new(Vec::new()) }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

impl Default for ReceiptSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reactor for ReceiptSender {
    fn name(&self) -> &str {
        "receipt_sender"
    }

    fn family(&self) -> ReactorFamily {
        ReactorFamily::Actor
    }

    fn handled_messages(&self) -> Vec<String> {
        vec![SEND_RECEIPT.to_string()]
    }

    fn consumer_info(&self) -> ConsumerInfo {
        ConsumerInfo::new("receipt_sender", StartFrom::Beginning)
    }

    async fn handle_batch(
        &self,
        batch: Vec<BatchEntry>,
        _history: Option<Vec<Message>>,
    ) -> CoreResult<Vec<ActionPair>> {
        let mut pairs = Vec::with_capacity(batch.len());
        for entry in batch {
            let message = entry.message;
            let cmd: SendReceiptCommand = serde_json::from_value(message.payload.clone())
                .map_err(|e| reactorcore::CoreError::InvalidMessage(e.to_string()))?;

            self.sent.lock().unwrap().push(cmd.email.clone());

            let event = message.follow(
                &message.stream_id,
                RECEIPT_SENT,
                serde_json::to_value(ReceiptSent { email: cmd.email }).unwrap(),
            );
            pairs.push(ActionPair::new(
                message,
                vec![Action::AppendAfter {
                    stream_id: event.stream_id.clone(),
                    messages: vec![event],
                }],
            ));
        }
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use reactorcore::backend::memory::MemoryBackend;
    use reactorcore::backend::{Backend, TransactionBlock};
    use std::sync::Arc;

    fn cmd(stream: &str, ty: &str, payload: serde_json::Value) -> Message {
        Message::new(stream, ty, payload)
    }

    /// Applies every pair's actions inside one shared transaction, the
    /// way `Router::handle_next_event_for_reactor` does (§4.7 step 7).
    async fn apply_pairs(backend: &Arc<dyn Backend>, pairs: Vec<ActionPair>) {
        let block: TransactionBlock = Box::new(move |tx| {
            async move {
                for pair in pairs {
                    for action in pair.actions {
                        action.execute(tx, &pair.source_message).await?;
                    }
                }
                Ok(())
            }
            .boxed()
        });
        backend.transaction(block).await.unwrap();
    }

    #[tokio::test]
    async fn cart_emits_item_added_for_add_item() {
        let cart = Cart::new();
        let message = cmd("cart-1", ADD_ITEM, serde_json::to_value(AddItem { sku: "A".into(), quantity: 2 }).unwrap())
            .with_seq(1);
        let batch = vec![BatchEntry { message: message.clone(), replaying: false }];

        let pairs = cart.handle_batch(batch, Some(vec![])).await.unwrap();
        assert_eq!(pairs.len(), 1);
        match &pairs[0].actions[0] {
            Action::AppendAfter { messages, .. } => {
                assert_eq!(messages[0].r#type, ITEM_ADDED);
            }
            _ => panic!("expected AppendAfter"),
        }
    }

    #[tokio::test]
    async fn cart_rejects_commands_after_checkout() {
        let cart = Cart::new();
        let checked_out = cmd(
            "cart-1",
            CHECKED_OUT,
            serde_json::to_value(CheckedOut { email: "a@example.com".into(), item_count: 1 }).unwrap(),
        );
        let history = vec![checked_out];

        let message = cmd("cart-1", ADD_ITEM, serde_json::to_value(AddItem { sku: "B".into(), quantity: 1 }).unwrap());
        let batch = vec![BatchEntry { message: message.clone(), replaying: false }];

        let pairs = cart.handle_batch(batch, Some(history)).await.unwrap();
        assert_eq!(pairs.len(), 1);
        assert!(matches!(pairs[0].actions[0], Action::Ack));
    }

    #[tokio::test]
    async fn send_receipt_fires_a_command_on_checkout() {
        let reaction = SendReceipt::new();
        let event = cmd(
            "cart-1",
            CHECKED_OUT,
            serde_json::to_value(CheckedOut { email: "a@example.com".into(), item_count: 3 }).unwrap(),
        );
        let batch = vec![BatchEntry { message: event, replaying: false }];

        let pairs = reaction.handle_batch(batch, None).await.unwrap();
        assert_eq!(pairs.len(), 1);
        match &pairs[0].actions[0] {
            Action::AppendNext { messages } => {
                assert_eq!(messages[0].r#type, SEND_RECEIPT);
                assert_eq!(messages[0].stream_id, "receipts");
            }
            _ => panic!("expected AppendNext"),
        }
    }

    #[tokio::test]
    async fn end_to_end_checkout_notifies_receipt_sender() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        backend.install().await.unwrap();

        let add = Message::new("cart-1", ADD_ITEM, serde_json::to_value(AddItem { sku: "A".into(), quantity: 2 }).unwrap());
        backend.append_next_to_stream("cart-1", vec![add]).await.unwrap();

        let checkout = Message::new("cart-1", CHECKOUT, serde_json::to_value(Checkout { email: "a@example.com".into() }).unwrap());
        backend.append_next_to_stream("cart-1", vec![checkout]).await.unwrap();

        let history = backend.read_stream("cart-1", None).await.unwrap();
        let cart = Cart::new();
        backend.register_consumer_group("cart", StartFrom::Beginning).await.unwrap();

        let claim = backend
            .claim_next_batch("cart", &[ADD_ITEM.to_string(), CHECKOUT.to_string()], 10, false, "w1")
            .await
            .unwrap()
            .unwrap();
        let pairs = cart.handle_batch(claim.batch, Some(history)).await.unwrap();
        apply_pairs(&backend, pairs).await;

        let sender = ReceiptSender::new();
        let cart_stream = backend.read_stream("cart-1", None).await.unwrap();
        let checked_out = cart_stream.iter().find(|m| m.r#type == CHECKED_OUT).unwrap().clone();

        let reaction = SendReceipt::new();
        let pairs = reaction
            .handle_batch(vec![BatchEntry { message: checked_out.clone(), replaying: false }], None)
            .await
            .unwrap();
        apply_pairs(&backend, pairs).await;

        let receipts_stream = backend.read_stream("receipts", None).await.unwrap();
        let send_cmd = receipts_stream.iter().find(|m| m.r#type == SEND_RECEIPT).unwrap().clone();
        let pairs = sender
            .handle_batch(vec![BatchEntry { message: send_cmd.clone(), replaying: false }], None)
            .await
            .unwrap();
        apply_pairs(&backend, pairs).await;

        assert_eq!(sender.sent(), vec!["a@example.com".to_string()]);
    }
}
