//! `LISTEN`/`NOTIFY` transport for [`reactorcore::notifier::Notifier`],
//! backed by the `reactorcore_messages` channel the init migration wires
//! up via `pg_notify` trigger.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::Mutex;

use reactorcore::notifier::{NotificationSource, NotifyResult};

const CHANNEL: &str = "reactorcore_messages";

/// Owns a dedicated `PgListener` connection, reconnecting it whenever the
/// notifier's `Disconnected` path is hit by the caller re-driving
/// `listen_once`.
pub struct PgNotificationSource {
    pool: PgPool,
    listener: Mutex<Option<PgListener>>,
}

impl PgNotificationSource {
    pub async fn connect(pool: PgPool) -> Result<Self, sqlx::Error> {
        let listener = Self::new_listener(&pool).await?;
        Ok(Self {
            pool,
            listener: Mutex::new(Some(listener)),
        })
    }

    async fn new_listener(pool: &PgPool) -> Result<PgListener, sqlx::Error> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(CHANNEL).await?;
        Ok(listener)
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn listen_once(&self, timeout: Duration) -> NotifyResult {
        let mut guard = self.listener.lock().await;

        if guard.is_none() {
            match Self::new_listener(&self.pool).await {
                Ok(l) => *guard = Some(l),
                Err(e) => return NotifyResult::Disconnected(e.to_string()),
            }
        }

        let listener = guard.as_mut().expect("listener just established");
        match tokio::time::timeout(timeout, listener.recv()).await {
            Ok(Ok(notification)) => NotifyResult::Types(vec![notification.payload().to_string()]),
            Ok(Err(e)) => {
                *guard = None;
                NotifyResult::Disconnected(e.to_string())
            }
            Err(_) => NotifyResult::Timeout,
        }
    }
}
