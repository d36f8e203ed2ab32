//! Configuration infrastructure
//!
//! Contains configuration loading and management for the market store.
//!
//! Configuration is a single JSON document in the user config directory,
//! written with defaults on first run. Every section falls back to its
//! defaults when missing, so older files keep loading.

#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Remote ESI client settings
    pub esi: EsiConfig,

    /// Trade history download and global history computation
    pub history: HistoryConfig,

    /// Regional order book download
    pub orders: OrderConfig,

    pub database: DatabaseConfig,

    pub logging: LoggingConfig,

    /// JSON file holding the SSO credentials (`ssoClientId`, ...)
    pub secrets_path: Option<PathBuf>,
}

/// Remote client behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EsiConfig {
    pub base_url: String,
    pub login_url: String,
    pub user_agent: String,

    /// Per-call network timeout
    pub request_timeout_secs: u64,

    /// Admission capacity shared by every remote call
    pub max_concurrent_requests: usize,

    /// Longest wait for an admission slot or for a cooldown to clear
    pub queue_timeout_secs: u64,

    /// Cooldown declared on 500/503
    pub overload_cooldown_secs: u64,

    /// Cooldown used when the remote hint is missing or out of range
    pub fallback_cooldown_secs: u64,

    /// Largest remote cooldown hint accepted as is
    pub max_cooldown_secs: u64,

    /// Largest accepted pagination count
    pub max_pages: u32,
}

/// History download settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Work units fetched and persisted together
    pub chunk_size: usize,

    /// Concurrent fetch workers per chunk
    pub workers: usize,

    /// Capacity of the work queue feeding the workers
    pub queue_capacity: usize,

    pub fetch_priority: i64,
    pub fetch_attempts: u32,

    /// Attempts of a whole chunk before giving up
    pub batch_attempts: u32,
    pub batch_retry_delay_secs: u64,

    /// Largest accepted history span in days
    pub max_span_days: i64,

    /// Longest time a chunk fetch may take
    pub batch_timeout_secs: u64,
}

/// Order book download settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderConfig {
    /// Regions whose order books are cached
    pub regions: Vec<i64>,

    /// Concurrent page fetchers per region
    pub workers: usize,

    pub fetch_priority: i64,
    pub fetch_attempts: u32,

    /// Longest time a single region download may take
    pub region_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file; defaults to the application data directory
    pub path: Option<PathBuf>,
    pub max_connections: u32,

    /// Deadline applied to every store operation
    pub operation_timeout_secs: u64,
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted logs
    pub json_format: bool,

    /// Enable console output
    pub console_output: bool,

    /// Enable file output
    pub file_output: bool,

    /// Log directory; defaults to `logs` next to the executable
    pub log_dir: Option<PathBuf>,

    pub file_name: String,

    /// "never", "daily" or "hourly"
    pub rotation: String,
}

impl Default for EsiConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::ESI_BASE_URL.to_string(),
            login_url: defaults::SSO_LOGIN_URL.to_string(),
            user_agent: defaults::USER_AGENT.to_string(),
            request_timeout_secs: defaults::REQUEST_TIMEOUT_SECONDS,
            max_concurrent_requests: defaults::MAX_CONCURRENT_REQUESTS,
            queue_timeout_secs: defaults::QUEUE_TIMEOUT_SECONDS,
            overload_cooldown_secs: defaults::OVERLOAD_COOLDOWN_SECONDS,
            fallback_cooldown_secs: defaults::FALLBACK_COOLDOWN_SECONDS,
            max_cooldown_secs: defaults::MAX_COOLDOWN_SECONDS,
            max_pages: defaults::MAX_PAGES,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            chunk_size: defaults::HISTORY_CHUNK_SIZE,
            workers: defaults::MAX_CONCURRENT_REQUESTS,
            queue_capacity: defaults::HISTORY_QUEUE_CAPACITY,
            fetch_priority: defaults::HISTORY_PRIORITY,
            fetch_attempts: defaults::FETCH_ATTEMPTS,
            batch_attempts: defaults::BATCH_ATTEMPTS,
            batch_retry_delay_secs: defaults::BATCH_RETRY_DELAY_SECONDS,
            max_span_days: defaults::MAX_SPAN_DAYS,
            batch_timeout_secs: defaults::BATCH_TIMEOUT_SECONDS,
        }
    }
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            regions: defaults::ORDER_REGIONS.to_vec(),
            workers: defaults::MAX_CONCURRENT_REQUESTS,
            fetch_priority: defaults::ORDER_PRIORITY,
            fetch_attempts: defaults::FETCH_ATTEMPTS,
            region_timeout_secs: defaults::BATCH_TIMEOUT_SECONDS,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: defaults::DB_MAX_CONNECTIONS,
            operation_timeout_secs: defaults::DB_OPERATION_TIMEOUT_SECONDS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: defaults::LOG_JSON_FORMAT,
            console_output: defaults::LOG_CONSOLE_OUTPUT,
            file_output: defaults::LOG_FILE_OUTPUT,
            log_dir: None,
            file_name: defaults::LOG_FILE_NAME.to_string(),
            rotation: defaults::LOG_ROTATION.to_string(),
        }
    }
}

impl EsiConfig {
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub const fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    pub const fn overload_cooldown(&self) -> Duration {
        Duration::from_secs(self.overload_cooldown_secs)
    }

    pub const fn fallback_cooldown(&self) -> Duration {
        Duration::from_secs(self.fallback_cooldown_secs)
    }
}

impl HistoryConfig {
    pub const fn batch_retry_delay(&self) -> Duration {
        Duration::from_secs(self.batch_retry_delay_secs)
    }

    pub const fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }
}

impl OrderConfig {
    pub const fn region_timeout(&self) -> Duration {
        Duration::from_secs(self.region_timeout_secs)
    }
}

impl DatabaseConfig {
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// sqlx connection URL of the configured (or default) database file
    pub fn database_url(&self) -> Result<String> {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => ConfigManager::get_app_data_dir()?
                .join("database")
                .join(defaults::DB_FILE_NAME),
        };
        Ok(format!("sqlite:{}", path.display()))
    }
}

/// Configuration manager for loading and saving settings
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join(defaults::APP_DIR_NAME);

        Ok(config_dir)
    }

    /// Get application data directory
    pub fn get_app_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to get user data directory")?
            .join(defaults::APP_DIR_NAME);

        Ok(data_dir)
    }

    /// Configuration manager for the default location
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_dir()?.join(defaults::CONFIG_FILE_NAME);
        Ok(Self { config_path })
    }

    /// Configuration manager for an explicit file
    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// Load configuration from file, creating default if it doesn't exist
    pub async fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!("🎉 Configuration file not found, creating default: {:?}", self.config_path);
            let default_config = AppConfig::default();
            self.save_config(&default_config).await?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .context("Failed to read configuration file")?;

        match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => {
                info!("Loaded configuration from: {:?}", self.config_path);
                Ok(config)
            }
            Err(parse_error) => {
                warn!("⚠️  Configuration file is invalid: {}", parse_error);
                warn!("⚠️  Resetting to default configuration");

                // Create backup of corrupted config
                let backup_path = self.config_path.with_extension("json.corrupted");
                if let Err(e) = fs::copy(&self.config_path, &backup_path).await {
                    warn!("Failed to create backup of corrupted config: {}", e);
                } else {
                    info!("Backed up corrupted config to: {:?}", backup_path);
                }

                let default_config = AppConfig::default();
                self.save_config(&default_config)
                    .await
                    .context("Failed to save default configuration")?;

                info!("✅ Reset to default configuration");
                Ok(default_config)
            }
        }
    }

    /// Save configuration to file
    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content = serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;

        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }

    /// Get the configuration file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

/// Default configuration values
pub mod defaults {
    pub const APP_DIR_NAME: &str = "market-store";
    pub const CONFIG_FILE_NAME: &str = "market_store_config.json";
    pub const DB_FILE_NAME: &str = "market_store.db";

    // Remote API
    pub const ESI_BASE_URL: &str = "https://esi.evetech.net/latest";
    pub const SSO_LOGIN_URL: &str = "https://login.eveonline.com/v2/oauth/token";
    pub const USER_AGENT: &str = "market-store/0.2 (commodity market cache)";

    /// Per-call network timeout in seconds
    pub const REQUEST_TIMEOUT_SECONDS: u64 = 7;

    /// Concurrent remote calls allowed at once
    pub const MAX_CONCURRENT_REQUESTS: usize = 10;

    /// Longest wait for admission or a cooldown, in seconds
    pub const QUEUE_TIMEOUT_SECONDS: u64 = 900;

    pub const OVERLOAD_COOLDOWN_SECONDS: u64 = 20;
    pub const FALLBACK_COOLDOWN_SECONDS: u64 = 10;
    pub const MAX_COOLDOWN_SECONDS: u64 = 120;
    pub const MAX_PAGES: u32 = 1000;

    pub const FETCH_ATTEMPTS: u32 = 5;

    // History download
    pub const HISTORY_CHUNK_SIZE: usize = 128;
    pub const HISTORY_QUEUE_CAPACITY: usize = 4;
    pub const HISTORY_PRIORITY: i64 = 1;
    pub const BATCH_ATTEMPTS: u32 = 3;
    pub const BATCH_RETRY_DELAY_SECONDS: u64 = 300;
    pub const BATCH_TIMEOUT_SECONDS: u64 = 900;
    pub const MAX_SPAN_DAYS: i64 = 1000;

    // Order download
    pub const ORDER_PRIORITY: i64 = 2;

    /// The Forge, Domain, Sinq Laison, Heimatar, Metropolis
    pub const ORDER_REGIONS: [i64; 5] = [10000002, 10000043, 10000032, 10000030, 10000042];

    // Database
    pub const DB_MAX_CONNECTIONS: u32 = 10;
    pub const DB_OPERATION_TIMEOUT_SECONDS: u64 = 300;

    // Logging
    pub const LOG_LEVEL: &str = "info";
    pub const LOG_JSON_FORMAT: bool = false;
    pub const LOG_CONSOLE_OUTPUT: bool = true;
    pub const LOG_FILE_OUTPUT: bool = true;
    pub const LOG_FILE_NAME: &str = "market-store.log";
    pub const LOG_ROTATION: &str = "daily";
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn first_load_writes_defaults() -> Result<()> {
        let dir = tempdir()?;
        let manager = ConfigManager::with_path(dir.path().join("config.json"));

        let config = manager.load_config().await?;
        assert!(manager.config_path().exists());
        assert_eq!(config.esi.max_concurrent_requests, 10);
        assert_eq!(config.history.chunk_size, 128);
        assert_eq!(config.history.batch_attempts, 3);
        assert_eq!(config.orders.fetch_priority, 2);
        Ok(())
    }

    #[tokio::test]
    async fn partial_file_fills_missing_sections() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"esi":{"max_concurrent_requests":4},"orders":{"regions":[10000002]}}"#).await?;

        let config = ConfigManager::with_path(&path).load_config().await?;
        assert_eq!(config.esi.max_concurrent_requests, 4);
        assert_eq!(config.esi.queue_timeout_secs, 900);
        assert_eq!(config.orders.regions, vec![10000002]);
        assert_eq!(config.logging.level, "info");
        Ok(())
    }

    #[tokio::test]
    async fn corrupted_file_is_backed_up_and_reset() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, "{ not json").await?;

        let config = ConfigManager::with_path(&path).load_config().await?;
        assert_eq!(config.history.fetch_attempts, 5);
        assert!(path.with_extension("json.corrupted").exists());
        Ok(())
    }

    #[test]
    fn explicit_database_path_becomes_sqlite_url() -> Result<()> {
        let config = DatabaseConfig {
            path: Some(PathBuf::from("/tmp/market.db")),
            ..DatabaseConfig::default()
        };
        assert_eq!(config.database_url()?, "sqlite:/tmp/market.db");
        Ok(())
    }
}
