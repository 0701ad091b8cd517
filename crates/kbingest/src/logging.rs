//! Tracing subscriber setup.
//!
//! Library code logs through the `log` macros and wraps pipeline steps and
//! reconciliation ticks in `tracing` spans. [`init`] routes both into one
//! `tracing-subscriber` registry.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
///
/// Only the first call has an effect; later calls return `false`.
pub fn init(config: &LoggingConfig) -> bool {
    let mut installed = false;
    INITIALIZED.get_or_init(|| {
        installed = install(config);
    });
    installed
}

fn install(config: &LoggingConfig) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // log records from dependencies and our own log:: calls
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("log bridge already installed: {}", e);
    }

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format {
        LogFormat::Text => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().with_target(true).compact()),
        ),
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_current_span(true)),
        ),
    };

    match result {
        Ok(()) => true,
        Err(e) => {
            eprintln!("Failed to install tracing subscriber: {}", e);
            false
        }
    }
}
