//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. Records carry structured fields
//! (`correlation_id`, `stage`, `service`) rather than interpolated strings, so
//! the JSON output can be filtered by request in a log pipeline.
//!
//! `RUST_LOG` takes precedence over the configured level when it is set.

use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::config::{LogFormat, LoggingConfig};
use crate::core::error::{GatewayError, GatewayResult};

/// Filter directives used when `RUST_LOG` is absent
pub fn default_directives(level: &str) -> String {
    let level = level.trim().to_ascii_lowercase();
    format!("dispatch_gateway={level},tower_http={level}")
}

fn env_filter(config: &LoggingConfig) -> GatewayResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_directives(&config.level)).map_err(|e| {
            GatewayError::config(format!("Invalid log level {:?}: {}", config.level, e))
        }),
    }
}

/// Initialize the tracing subscriber
///
/// A second call (for example from tests sharing a process) leaves the
/// existing subscriber in place.
pub fn init_logging(config: &LoggingConfig) -> GatewayResult<()> {
    let filter = env_filter(config)?;

    let result = match config.format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init(),
    };

    if result.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives() {
        assert_eq!(
            default_directives(" DEBUG "),
            "dispatch_gateway=debug,tower_http=debug"
        );
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let config = LoggingConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_ok());
    }
}
