//! End-to-end: append AddItem + Checkout, run the supervisor against an
//! in-memory SQLite backend, and confirm the receipt reaches the sender.

use std::sync::Arc;
use std::time::Duration;

use reactorcore::backend::{Backend, StartFrom};
use reactorcore::{Config, Message, Supervisor};
use reactorcore_demo::{types::AddItem, types::Checkout, Cart, ReceiptSender, SendReceipt, ADD_ITEM, CHECKOUT};
use reactorcore_sqlite::{InProcessNotificationSource, SqliteBackend, SqliteBackendConfig, SqlitePoolHandle};

#[tokio::test]
async fn checkout_flows_through_to_a_sent_receipt() {
    let config = SqliteBackendConfig::in_memory();
    let pool = SqlitePoolHandle::connect(&config).await.unwrap();
    let sqlite_backend = SqliteBackend::new(pool.pool().clone());
    let notify_bus = sqlite_backend.notify_bus();
    let backend: Arc<dyn Backend> = Arc::new(sqlite_backend);
    backend.install().await.unwrap();

    for group in ["cart", "send_receipt", "receipt_sender"] {
        backend.register_consumer_group(group, StartFrom::Beginning).await.unwrap();
    }

    let add = Message::new(
        "cart-1",
        ADD_ITEM,
        serde_json::to_value(AddItem { sku: "widget".into(), quantity: 2 }).unwrap(),
    );
    backend.append_next_to_stream("cart-1", vec![add]).await.unwrap();

    let checkout = Message::new(
        "cart-1",
        CHECKOUT,
        serde_json::to_value(Checkout { email: "customer@example.com".into() }).unwrap(),
    );
    backend.append_next_to_stream("cart-1", vec![checkout]).await.unwrap();

    let receipt_sender = Arc::new(ReceiptSender::new());

    let mut supervisor = Supervisor::new(Config::builder().worker_count(1).build(), backend.clone())
        .with_notification_source(Arc::new(InProcessNotificationSource::new(&notify_bus)));
    supervisor.register_reactor(Arc::new(Cart::new()));
    supervisor.register_reactor(Arc::new(SendReceipt::new()));
    supervisor.register_reactor(receipt_sender.clone());

    let handle = supervisor.start().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.shutdown().await;

    assert_eq!(receipt_sender.sent(), vec!["customer@example.com".to_string()]);

    let cart_stream = backend.read_stream("cart-1", None).await.unwrap();
    assert!(cart_stream.iter().any(|m| m.r#type == "cart.ItemAdded"));
    assert!(cart_stream.iter().any(|m| m.r#type == "cart.CheckedOut"));
}

#[tokio::test]
async fn second_checkout_on_the_same_cart_is_ignored() {
    let config = SqliteBackendConfig::in_memory();
    let pool = SqlitePoolHandle::connect(&config).await.unwrap();
    let sqlite_backend = SqliteBackend::new(pool.pool().clone());
    let backend: Arc<dyn Backend> = Arc::new(sqlite_backend);
    backend.install().await.unwrap();
    backend.register_consumer_group("cart", StartFrom::Beginning).await.unwrap();

    let checkout_one = Message::new(
        "cart-2",
        CHECKOUT,
        serde_json::to_value(Checkout { email: "first@example.com".into() }).unwrap(),
    );
    backend.append_next_to_stream("cart-2", vec![checkout_one]).await.unwrap();

    let checkout_two = Message::new(
        "cart-2",
        CHECKOUT,
        serde_json::to_value(Checkout { email: "second@example.com".into() }).unwrap(),
    );
    backend.append_next_to_stream("cart-2", vec![checkout_two]).await.unwrap();

    let history = backend.read_stream("cart-2", None).await.unwrap();
    let claim = backend
        .claim_next_batch("cart", &[ADD_ITEM.to_string(), CHECKOUT.to_string()], 10, false, "w1")
        .await
        .unwrap()
        .unwrap();

    let cart = Cart::new();
    let pairs = cart.handle_batch(claim.batch, Some(history)).await.unwrap();
    assert_eq!(pairs.len(), 2);
    assert!(matches!(pairs[1].actions[0], reactorcore::Action::Ack));
}
