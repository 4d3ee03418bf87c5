//! Connection configuration for the SQLite backend (SPEC_FULL.md §10.3).
//! A single-writer backend has no pool-sizing tradeoff worth exposing:
//! the connection count is fixed at one, so the log's own row locking
//! stands in for `SKIP LOCKED` (§4.2, §9 "Multiple backend variants").

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct SqliteBackendConfig {
    pub path: String,
    pub busy_timeout_ms: u64,
}

impl SqliteBackendConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }

    /// An ephemeral in-memory database, useful for tests and the demo crate.
    pub fn in_memory() -> Self {
        Self::new(":memory:")
    }

    /// Read `SQLITE_PATH` (optionally from a `.env` file loaded via
    /// `dotenvy`), falling back to an in-memory database if unset.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        match std::env::var("SQLITE_PATH") {
            Ok(path) => Self::new(path),
            Err(_) => Self::in_memory(),
        }
    }

    pub fn busy_timeout_ms(mut self, ms: u64) -> Self {
        self.busy_timeout_ms = ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_carries_the_special_path() {
        let config = SqliteBackendConfig::in_memory();
        assert_eq!(config.path, ":memory:");
    }
}
