//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. `RUST_LOG` wins over the configured
//! level; output is JSON or human-readable depending on `observability.logging.format`.

use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::config::LoggingConfig;
use crate::core::error::MeshResult;

/// Map a configured level name to a `tracing` level, defaulting to INFO
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Build the filter: `RUST_LOG` when set, the configured level otherwise
pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(parse_level(&config.level).to_string().to_lowercase()))
}

/// Initialize the global subscriber.
///
/// A second call is harmless: the existing subscriber stays in place.
pub fn init_logging(config: &LoggingConfig) -> MeshResult<()> {
    let filter = build_filter(config);

    let result = match config.format.as_str() {
        "pretty" => Registry::default()
            .with(filter)
            .with(fmt::layer().pretty().with_target(true).with_thread_ids(true))
            .try_init(),
        _ => Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
    };

    if result.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
        return Ok(());
    }

    info!(level = %config.level, format = %config.format, "Structured logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }

    #[test]
    fn test_init_logging_twice() {
        let config = LoggingConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_ok());
    }
}
