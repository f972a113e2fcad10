use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub pool: PoolConfig,
    pub query: QueryConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: String,
    pub log_level: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

/// Connection pool sizing.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub acquire_timeout_ms: u64,
}

/// In-memory query cache, metric log, and bulk-write tuning.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct QueryConfig {
    pub cache_capacity: usize,
    pub default_ttl_secs: u64,
    pub metrics_capacity: usize,
    pub slow_query_threshold_ms: f64,
    pub batch_size: usize,
}

/// Persistent context cache repository.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_hours: f64,
    pub max_entries: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: "stdio".into(),
            log_level: "info".into(),
            host: "127.0.0.1".into(),
            port: 8765,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_data_dir()
            .join("conversations.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            acquire_timeout_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1000,
            default_ttl_secs: 300,
            metrics_capacity: 1000,
            slow_query_threshold_ms: 100.0,
            batch_size: 1000,
        }
    }
}

impl QueryConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_hours: 24.0,
            max_entries: 1000,
        }
    }
}

/// Returns `~/.convostore/`, or `./.convostore/` when no home directory is known.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".convostore")
}

/// Returns the default config file path: `~/.convostore/config.toml`
pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.toml")
}

impl AppConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            AppConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    /// (CONVOSTORE_DB, CONVOSTORE_LOG_LEVEL, CONVOSTORE_POOL_MAX).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CONVOSTORE_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("CONVOSTORE_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("CONVOSTORE_POOL_MAX") {
            match val.parse::<usize>() {
                Ok(max) => {
                    self.pool.max_connections = max;
                    self.pool.min_connections = self.pool.min_connections.min(max);
                }
                Err(_) => tracing::warn!(value = %val, "ignoring non-numeric CONVOSTORE_POOL_MAX"),
            }
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.server.transport, "stdio");
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.pool.acquire_timeout_ms, 30_000);
        assert!(config.pool.min_connections <= config.pool.max_connections);
        assert_eq!(config.query.default_ttl(), Duration::from_secs(300));
        assert_eq!(config.query.batch_size, 1000);
        assert!(config.storage.db_path.ends_with("conversations.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"

[storage]
db_path = "/tmp/test.db"

[pool]
max_connections = 4

[cache]
default_ttl_hours = 2.5
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.pool.max_connections, 4);
        assert_eq!(config.cache.default_ttl_hours, 2.5);
        // defaults still apply for unset fields
        assert_eq!(config.pool.min_connections, 2);
        assert_eq!(config.query.cache_capacity, 1000);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = AppConfig::default();
        std::env::set_var("CONVOSTORE_DB", "/tmp/override.db");
        std::env::set_var("CONVOSTORE_LOG_LEVEL", "trace");
        std::env::set_var("CONVOSTORE_POOL_MAX", "1");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.server.log_level, "trace");
        assert_eq!(config.pool.max_connections, 1);
        assert_eq!(config.pool.min_connections, 1);

        // Clean up
        std::env::remove_var("CONVOSTORE_DB");
        std::env::remove_var("CONVOSTORE_LOG_LEVEL");
        std::env::remove_var("CONVOSTORE_POOL_MAX");
    }

    #[test]
    fn expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/var/db.sqlite"), PathBuf::from("/var/db.sqlite"));
    }
}
