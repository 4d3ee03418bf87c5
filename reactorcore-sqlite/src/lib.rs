//! SQLite `Backend` for `reactorcore`: a single-connection pool gives
//! the same single-writer serialization the pack's database-level
//! fallback calls for, with an in-process broadcast channel standing in
//! for `LISTEN`/`NOTIFY`.
//!
//! ```no_run
//! use reactorcore_sqlite::{SqliteBackend, SqliteBackendConfig, SqlitePoolHandle};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SqliteBackendConfig::in_memory();
//! let pool = SqlitePoolHandle::connect(&config).await?;
//! let backend = SqliteBackend::new(pool.pool().clone());
//! # let _ = backend;
//! # Ok(())
//! # }
//! ```

mod backend;
mod config;
mod error;
mod notifier;
mod pool;

pub use backend::SqliteBackend;
pub use config::SqliteBackendConfig;
pub use error::SqliteError;
pub use notifier::{InProcessNotificationSource, NotifyBus};
pub use pool::SqlitePoolHandle;
