pub mod loader;
pub mod schema;
pub mod secrets;

pub use loader::{load_config, load_config_from_str, validate_config};
pub use schema::{
    Config, DatabaseConfig, EngineConfig, IndexingConfig, LogFormat, LoggingConfig,
    SchedulerConfig, StorageConfig,
};
pub use secrets::{resolve_secret, resolve_secret_optional, SecretError};
