use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use super::secrets::resolve_secret_optional;
use crate::error::ConfigError;
use crate::fetch::{DEFAULT_DOWNLOAD_TIMEOUT, DEFAULT_USER_AGENT};
use crate::model::MAX_BATCH_SIZE;
use crate::ratelimit::RateLimitConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Defaults to `~/.kbingest/data/kbingest.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => crate::db::default_database_path().ok_or_else(|| ConfigError::Validation {
                message: "database.path is not set and no home directory was found".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_batch_cap")]
    pub batch_cap: usize,
    #[serde(default = "default_max_concurrent_items")]
    pub max_concurrent_items: usize,
    /// When false, jobs finalize as soon as every item resolves instead of
    /// waiting for the indexing pass.
    #[serde(default = "default_true")]
    pub require_index_confirmation: bool,
    #[serde(default = "default_storage_prefix")]
    pub storage_prefix: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

fn default_batch_cap() -> usize {
    MAX_BATCH_SIZE
}

fn default_max_concurrent_items() -> usize {
    num_cpus::get().clamp(1, 4)
}

fn default_true() -> bool {
    true
}

fn default_storage_prefix() -> String {
    "ingest".to_string()
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT.as_secs()
}

impl EngineConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_cap: default_batch_cap(),
            max_concurrent_items: default_max_concurrent_items(),
            require_index_confirmation: true,
            storage_prefix: default_storage_prefix(),
            user_agent: default_user_agent(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_confirmation_interval_secs")]
    pub confirmation_interval_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    /// Awaiting jobs older than this are failed by the health check.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_confirmation_interval_secs() -> u64 {
    120
}

fn default_health_interval_secs() -> u64 {
    900
}

fn default_stale_after_secs() -> u64 {
    24 * 60 * 60
}

impl SchedulerConfig {
    pub fn confirmation_interval(&self) -> Duration {
        Duration::from_secs(self.confirmation_interval_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            confirmation_interval_secs: default_confirmation_interval_secs(),
            health_interval_secs: default_health_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the filesystem object store. Defaults to `~/.kbingest/objects`.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_root(&self) -> Result<PathBuf, ConfigError> {
        match &self.root {
            Some(root) => Ok(root.clone()),
            None => dirs::home_dir()
                .map(|h| h.join(".kbingest").join("objects"))
                .ok_or_else(|| ConfigError::Validation {
                    message: "storage.root is not set and no home directory was found"
                        .to_string(),
                }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    #[serde(default)]
    pub base_url: String,
    /// Knowledge base that every data source is registered with.
    #[serde(default)]
    pub knowledge_base_id: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub api_token_file: Option<String>,
    #[serde(default)]
    pub api_token_env_var: Option<String>,
    #[serde(default = "default_indexing_timeout_secs")]
    pub timeout_secs: u64,
    /// How many times a throttled registration or pass start is re-sent
    /// before the error reaches the caller.
    #[serde(default = "default_throttle_retries")]
    pub throttle_retries: u32,
}

fn default_indexing_timeout_secs() -> u64 {
    30
}

fn default_throttle_retries() -> u32 {
    2
}

impl IndexingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn resolve_api_token(&self) -> Result<Option<SecretString>, ConfigError> {
        resolve_secret_optional(
            self.api_token.as_deref(),
            self.api_token_file.as_deref(),
            self.api_token_env_var.as_deref(),
        )
        .map_err(|e| ConfigError::Secret {
            name: "indexing.api_token".to_string(),
            reason: e.to_string(),
        })
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            knowledge_base_id: String::new(),
            api_token: None,
            api_token_file: None,
            api_token_env_var: None,
            timeout_secs: default_indexing_timeout_secs(),
            throttle_retries: default_throttle_retries(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}
