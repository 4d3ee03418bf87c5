//! Connection configuration, loaded from the environment via `dotenvy`
//! the way the pack's `PostgresConfig`/`PostgresService::init` is
//! (SPEC_FULL.md §10.3).

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_MIN_CONNECTIONS: u32 = 1;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct PostgresBackendConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl PostgresBackendConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            acquire_timeout_secs: DEFAULT_ACQUIRE_TIMEOUT_SECS,
        }
    }

    /// Read `DATABASE_URL` (optionally from a `.env` file loaded via
    /// `dotenvy`) and build a config with default pool sizing.
    pub fn from_env() -> Result<Self, crate::error::PostgresError> {
        let _ = dotenvy::dotenv();
        let url = std::env::var("DATABASE_URL")
            .map_err(|_| crate::error::PostgresError::Config("DATABASE_URL is not set".into()))?;
        Ok(Self::new(url))
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    pub fn min_connections(mut self, n: u32) -> Self {
        self.min_connections = n;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_carries_sensible_defaults() {
        let config = PostgresBackendConfig::new("postgres://localhost/test");
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.min_connections, DEFAULT_MIN_CONNECTIONS);
    }
}
