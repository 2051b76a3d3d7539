//! Database connection settings.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::error::Result;

/// Default connection URL when `DATABASE_URL` is unset.
pub const DEFAULT_DATABASE_URL: &str = "postgres://localhost/tessera";

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    pub url: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// How long to wait for a pooled connection.
    pub acquire_timeout: Duration,
    /// Server-side `statement_timeout`, if any.
    pub statement_timeout: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            statement_timeout: None,
        }
    }
}

impl DatabaseConfig {
    /// Creates a configuration for the given URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Reads `DATABASE_URL`, `DATABASE_MAX_CONNECTIONS` and
    /// `DATABASE_STATEMENT_TIMEOUT_MS`, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup("DATABASE_URL") {
            config.url = url;
        }
        if let Some(max) = lookup("DATABASE_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            config.max_connections = max;
        }
        if let Some(ms) = lookup("DATABASE_STATEMENT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.statement_timeout = Some(Duration::from_millis(ms));
        }
        config
    }

    /// Sets the pool size.
    #[must_use]
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the acquire timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets the statement timeout.
    #[must_use]
    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    /// Opens a connection pool.
    pub async fn connect(&self) -> Result<PgPool> {
        let statement_timeout = self.statement_timeout;
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if let Some(timeout) = statement_timeout {
                        let sql = format!("SET statement_timeout = {}", timeout.as_millis());
                        sqlx::query(&sql).execute(conn).await?;
                    }
                    Ok(())
                })
            })
            .connect(&self.url)
            .await?;

        info!(max_connections = self.max_connections, "Connected to database");
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::default();
        assert_eq!(config.url, DEFAULT_DATABASE_URL);
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.statement_timeout, None);
    }

    #[test]
    fn test_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("DATABASE_URL", "postgres://db/app"),
            ("DATABASE_MAX_CONNECTIONS", "12"),
            ("DATABASE_STATEMENT_TIMEOUT_MS", "1500"),
        ]
        .into_iter()
        .collect();

        let config = DatabaseConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.url, "postgres://db/app");
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.statement_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_from_lookup_ignores_garbage() {
        let config = DatabaseConfig::from_lookup(|k| {
            (k == "DATABASE_MAX_CONNECTIONS").then(|| "many".to_string())
        });
        assert_eq!(config.max_connections, 5);
    }

    #[test]
    fn test_builder() {
        let config = DatabaseConfig::new("postgres://x/y")
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(1))
            .statement_timeout(Duration::from_secs(3));
        assert_eq!(config.url, "postgres://x/y");
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.acquire_timeout, Duration::from_secs(1));
        assert_eq!(config.statement_timeout, Some(Duration::from_secs(3)));
    }
}
