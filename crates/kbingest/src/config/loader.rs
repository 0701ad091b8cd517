use std::path::{Path, PathBuf};

use crate::config::schema::Config;
use crate::error::ConfigError;
use crate::model::MAX_BATCH_SIZE;
use crate::ratelimit::PoolConfig;

pub const ENV_DATABASE_PATH: &str = "KBINGEST_DATABASE_PATH";
pub const ENV_LOG_LEVEL: &str = "KBINGEST_LOG_LEVEL";
pub const ENV_INDEXING_BASE_URL: &str = "KBINGEST_INDEXING_BASE_URL";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let mut config: Config = serde_json::from_str(content)?;

    apply_env_overrides(&mut config);

    validate_config(&config)?;

    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Some(path) = non_empty_env(ENV_DATABASE_PATH) {
        config.database.path = Some(PathBuf::from(path));
    }
    if let Some(level) = non_empty_env(ENV_LOG_LEVEL) {
        config.logging.level = level;
    }
    if let Some(url) = non_empty_env(ENV_INDEXING_BASE_URL) {
        config.indexing.base_url = url;
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let engine = &config.engine;
    if engine.batch_cap == 0 || engine.batch_cap > MAX_BATCH_SIZE {
        return Err(ConfigError::Validation {
            message: format!(
                "engine.batch_cap must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, engine.batch_cap
            ),
        });
    }
    if engine.max_concurrent_items == 0 {
        return Err(ConfigError::Validation {
            message: "engine.max_concurrent_items must be at least 1".to_string(),
        });
    }
    if engine.storage_prefix.trim_matches('/').is_empty() {
        return Err(ConfigError::Validation {
            message: "engine.storage_prefix must not be empty".to_string(),
        });
    }

    validate_pool("rate_limit.general", &config.rate_limit.general)?;
    validate_pool("rate_limit.restricted", &config.rate_limit.restricted)?;

    let scheduler = &config.scheduler;
    if scheduler.confirmation_interval_secs == 0 || scheduler.health_interval_secs == 0 {
        return Err(ConfigError::Validation {
            message: "scheduler intervals must be at least one second".to_string(),
        });
    }

    if !config.indexing.base_url.is_empty()
        && !config.indexing.base_url.starts_with("http://")
        && !config.indexing.base_url.starts_with("https://")
    {
        return Err(ConfigError::Validation {
            message: format!(
                "indexing.base_url must be an http(s) URL, got '{}'",
                config.indexing.base_url
            ),
        });
    }

    Ok(())
}

fn validate_pool(name: &str, pool: &PoolConfig) -> Result<(), ConfigError> {
    if pool.burst == 0 {
        return Err(ConfigError::Validation {
            message: format!("{}.burst must be at least 1", name),
        });
    }
    if !pool.refill_per_sec.is_finite() || pool.refill_per_sec <= 0.0 {
        return Err(ConfigError::Validation {
            message: format!(
                "{}.refill_per_sec must be positive, got {}",
                name, pool.refill_per_sec
            ),
        });
    }
    Ok(())
}
