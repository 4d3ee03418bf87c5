//! Runs the `Cart` / `SendReceipt` / `ReceiptSender` pipeline against an
//! in-memory SQLite backend: append an `AddItem` and a `Checkout`
//! command, start the supervisor, and watch the receipt get "sent".

use std::sync::Arc;
use std::time::Duration;

use reactorcore::backend::{Backend, StartFrom};
use reactorcore::{Config, Message, Supervisor};
use reactorcore_demo::{types::AddItem, types::Checkout, Cart, ReceiptSender, SendReceipt, ADD_ITEM, CHECKOUT};
use reactorcore_sqlite::{InProcessNotificationSource, SqliteBackend, SqliteBackendConfig, SqlitePoolHandle};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = SqliteBackendConfig::in_memory();
    let pool = SqlitePoolHandle::connect(&config).await?;
    let sqlite_backend = SqliteBackend::new(pool.pool().clone());
    let notify_bus = sqlite_backend.notify_bus();
    let backend: Arc<dyn Backend> = Arc::new(sqlite_backend);
    backend.install().await?;

    backend
        .register_consumer_group("cart", StartFrom::Beginning)
        .await?;
    backend
        .register_consumer_group("send_receipt", StartFrom::Beginning)
        .await?;
    backend
        .register_consumer_group("receipt_sender", StartFrom::Beginning)
        .await?;

    let add = Message::new("cart-1", ADD_ITEM, serde_json::to_value(AddItem { sku: "widget".into(), quantity: 3 })?);
    backend.append_next_to_stream("cart-1", vec![add]).await?;

    let checkout = Message::new(
        "cart-1",
        CHECKOUT,
        serde_json::to_value(Checkout { email: "customer@example.com".into() })?,
    );
    backend.append_next_to_stream("cart-1", vec![checkout]).await?;

    let receipt_sender = Arc::new(ReceiptSender::new());

    let mut supervisor = Supervisor::new(Config::builder().worker_count(1).build(), backend.clone())
        .with_notification_source(Arc::new(InProcessNotificationSource::new(&notify_bus)));
    supervisor.register_reactor(Arc::new(Cart::new()));
    supervisor.register_reactor(Arc::new(SendReceipt::new()));
    supervisor.register_reactor(receipt_sender.clone());

    let handle = supervisor.start().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.shutdown().await;

    println!("receipts sent: {:?}", receipt_sender.sent());
    Ok(())
}
