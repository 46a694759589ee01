//! Storage layer configuration.
//!
//! Loading configuration files is the embedding application's job; this module only
//! defines the settings the storage layer understands, their defaults, and a small
//! environment override hook.

use serde::{Deserialize, Serialize};

/// Environment variable overriding [`StorageConfig::database_url`].
pub const ENV_DATABASE_URL: &str = "RECORD_STORE_DATABASE_URL";
/// Environment variable overriding [`StorageConfig::max_connections`].
pub const ENV_MAX_CONNECTIONS: &str = "RECORD_STORE_MAX_CONNECTIONS";
/// Environment variable overriding [`StorageConfig::busy_timeout_ms`].
pub const ENV_BUSY_TIMEOUT_MS: &str = "RECORD_STORE_BUSY_TIMEOUT_MS";
/// Environment variable overriding [`StorageConfig::watch_buffer`].
pub const ENV_WATCH_BUFFER: &str = "RECORD_STORE_WATCH_BUFFER";
/// Environment variable overriding [`StorageConfig::change_log_capacity`].
pub const ENV_CHANGE_LOG_CAPACITY: &str = "RECORD_STORE_CHANGE_LOG_CAPACITY";

/// Settings for the SQL pool and the document change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// sqlx connection URL, e.g. `sqlite://data.db` or `sqlite::memory:`.
    pub database_url: String,
    /// Upper bound on pooled SQL connections.
    pub max_connections: u32,
    /// SQLite busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
    /// Capacity of each change-feed channel handed to a watcher.
    pub watch_buffer: usize,
    /// Number of change notifications a document collection retains for slow watchers.
    pub change_log_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 5,
            busy_timeout_ms: 5_000,
            watch_buffer: 64,
            change_log_capacity: 256,
        }
    }
}

impl StorageConfig {
    /// Defaults with environment overrides applied.
    ///
    /// Unparseable numeric values are ignored and the default is kept.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| lookup(key).map(|v| v.trim().to_string());
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.database_url = url;
        }
        if let Some(n) = parse(ENV_MAX_CONNECTIONS).and_then(|v| v.parse().ok()) {
            self.max_connections = n;
        }
        if let Some(n) = parse(ENV_BUSY_TIMEOUT_MS).and_then(|v| v.parse().ok()) {
            self.busy_timeout_ms = n;
        }
        if let Some(n) = parse(ENV_WATCH_BUFFER).and_then(|v| v.parse().ok()) {
            self.watch_buffer = n;
        }
        if let Some(n) = parse(ENV_CHANGE_LOG_CAPACITY).and_then(|v| v.parse().ok()) {
            self.change_log_capacity = n;
        }
        self
    }

    /// True when the URL points at a private in-memory SQLite database.
    pub fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_in_memory_sqlite() {
        let config = StorageConfig::default();
        assert!(config.is_in_memory());
        assert_eq!(config.watch_buffer, 64);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: StorageConfig =
            serde_json::from_str(r#"{"database_url": "sqlite://app.db", "watch_buffer": 8}"#)
                .unwrap();
        assert_eq!(config.database_url, "sqlite://app.db");
        assert_eq!(config.watch_buffer, 8);
        assert_eq!(config.max_connections, 5);
        assert!(!config.is_in_memory());
    }

    #[test]
    fn overrides_cover_every_setting() {
        let vars = std::collections::HashMap::from([
            (ENV_DATABASE_URL, "sqlite://ops.db"),
            (ENV_MAX_CONNECTIONS, "9"),
            (ENV_BUSY_TIMEOUT_MS, " 250 "),
            (ENV_WATCH_BUFFER, "lots"),
            (ENV_CHANGE_LOG_CAPACITY, "32"),
        ]);
        let config = StorageConfig::default()
            .with_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.database_url, "sqlite://ops.db");
        assert_eq!(config.max_connections, 9);
        assert_eq!(config.busy_timeout_ms, 250);
        // Unparseable values keep the default.
        assert_eq!(config.watch_buffer, 64);
        assert_eq!(config.change_log_capacity, 32);
    }
}
