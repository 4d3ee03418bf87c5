//! Connection pool lifecycle. Pinned to a single connection: SQLite
//! allows only one writer at a time, so rather than fight that with
//! retries we hand the backend exactly the serialization the pack's
//! Postgres path gets from `SKIP LOCKED` (SPEC_FULL.md §10.3, §4.2).

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

use crate::config::SqliteBackendConfig;
use crate::error::SqliteError;

pub struct SqlitePoolHandle {
    pub(crate) pool: SqlitePool,
}

impl SqlitePoolHandle {
    pub async fn connect(config: &SqliteBackendConfig) -> Result<Self, SqliteError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", config.path))
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::debug!(path = %config.path, "reactorcore-sqlite pool connected and migrated");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::debug!("reactorcore-sqlite pool closed");
    }
}
