//! Connection pool lifecycle, mirroring `PostgresService::init` in the
//! pack's data layer.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use crate::config::PostgresBackendConfig;
use crate::error::PostgresError;

/// Owns the pool and runs migrations on construction.
pub struct PostgresPool {
    pub(crate) pool: PgPool,
}

impl PostgresPool {
    pub async fn connect(config: &PostgresBackendConfig) -> Result<Self, PostgresError> {
        if config.url.is_empty() {
            return Err(PostgresError::Config("PostgreSQL URL is required".into()));
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::debug!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "reactorcore-postgres pool connected and migrated"
        );

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::debug!("reactorcore-postgres pool closed");
    }
}
