//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` pipeline configured from [`LoggingConfig`].
//! `RUST_LOG` takes precedence over the configured level when set.

use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// Returns `false` if a subscriber was already installed, in which case the
/// existing one is left untouched.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()));

    let installed = if config.json_format {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(config.show_target))
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(config.show_target))
            .with(filter)
            .try_init()
    };

    match installed {
        Ok(()) => {
            tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
            true
        }
        Err(_) => false,
    }
}
