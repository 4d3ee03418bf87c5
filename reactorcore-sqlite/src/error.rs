//! SQLite-specific error type, wrapping `sqlx::Error` (SPEC_FULL.md §10.2).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SqliteError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<SqliteError> for reactorcore::CoreError {
    fn from(err: SqliteError) -> Self {
        reactorcore::CoreError::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = SqliteError::Config("missing path".to_string());
        assert_eq!(err.to_string(), "configuration error: missing path");
    }
}
