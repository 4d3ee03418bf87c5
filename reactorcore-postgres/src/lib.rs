//! PostgreSQL `Backend` for `reactorcore`: `SELECT ... FOR UPDATE SKIP
//! LOCKED` claiming over a relational log, with `LISTEN`/`NOTIFY`
//! fan-out in place of polling.
//!
//! ```no_run
//! use reactorcore_postgres::{PostgresBackend, PostgresBackendConfig, PostgresPool};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PostgresBackendConfig::from_env()?;
//! let pool = PostgresPool::connect(&config).await?;
//! let backend = PostgresBackend::new(pool.pool().clone());
//! # let _ = backend;
//! # Ok(())
//! # }
//! ```

mod backend;
mod config;
mod error;
mod notifier;
mod pool;

pub use backend::PostgresBackend;
pub use config::PostgresBackendConfig;
pub use error::PostgresError;
pub use notifier::PgNotificationSource;
pub use pool::PostgresPool;
