//! Logging.

use serde::Deserialize;
use serde_with::serde_as;
use sluice_common::deser::PermissiveBool;
use sluice_config::GenericConfiguration;
use sluice_error::{generic_error, ErrorContext as _, GenericError};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter, Layer};

const LOG_LEVEL_ENV_VAR: &str = "SLUICE_LOG_LEVEL";
const LOG_FORMAT_JSON_ENV_VAR: &str = "SLUICE_LOG_FORMAT_JSON";

/// Prints `message` to standard error and exits with status 1.
///
/// For errors raised before logging is set up, where there is nowhere else to report them.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("sluice: fatal: {}", message);
    std::process::exit(1);
}

fn default_log_level() -> LogFilter {
    LevelFilter::INFO.into()
}

/// Logging configuration.
#[serde_as]
#[derive(Deserialize)]
pub struct LoggingConfiguration {
    /// Filtering directives, in `EnvFilter` syntax (`info`, `sluice_bolt=debug,warn`, ...).
    #[serde(default = "default_log_level")]
    log_level: LogFilter,

    /// Whether to emit logs as JSON rather than human-readable text.
    #[serde_as(as = "PermissiveBool")]
    #[serde(default)]
    log_format_json: bool,
}

impl LoggingConfiguration {
    /// Reads the `log_level` and `log_format_json` keys of `config`.
    ///
    /// # Errors
    ///
    /// If either key holds an invalid value, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    /// Creates a `LoggingConfiguration` from the process environment.
    ///
    /// `SLUICE_LOG_LEVEL` provides the filtering directives, falling back to `default_level` if unset or invalid, and
    /// `SLUICE_LOG_FORMAT_JSON` (`true`/`1`) switches to JSON output.
    pub fn from_environment(default_level: Option<LevelFilter>) -> Self {
        let log_level = LogFilter(
            EnvFilter::builder()
                .with_default_directive(default_level.unwrap_or(LevelFilter::INFO).into())
                .with_env_var(LOG_LEVEL_ENV_VAR)
                .from_env_lossy(),
        );

        let log_format_json = std::env::var(LOG_FORMAT_JSON_ENV_VAR)
            .map(|s| s.trim().to_lowercase())
            .map(|s| s == "true" || s == "1")
            .unwrap_or(false);

        Self {
            log_level,
            log_format_json,
        }
    }
}

#[derive(Deserialize)]
#[serde(try_from = "String")]
struct LogFilter(EnvFilter);

impl From<LevelFilter> for LogFilter {
    fn from(level: LevelFilter) -> Self {
        Self(EnvFilter::default().add_directive(level.into()))
    }
}

impl TryFrom<String> for LogFilter {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let directives = value.trim();
        if directives.is_empty() {
            return Err(generic_error!("Log level must name at least one directive."));
        }

        let filter = EnvFilter::builder()
            .parse(directives)
            .with_error_context(|| format!("Invalid log level '{}'.", directives))?;
        Ok(Self(filter))
    }
}

/// Installs the global `tracing` subscriber, configured from the process environment.
///
/// See [`LoggingConfiguration::from_environment`] for the variables consulted.
///
/// # Errors
///
/// If a global subscriber is already installed, an error is returned.
pub fn initialize_logging(default_level: Option<LevelFilter>) -> Result<(), GenericError> {
    initialize_logging_from_configuration(LoggingConfiguration::from_environment(default_level))
}

/// Installs the global `tracing` subscriber with the given configuration.
///
/// # Errors
///
/// If a global subscriber is already installed, an error is returned.
pub fn initialize_logging_from_configuration(config: LoggingConfiguration) -> Result<(), GenericError> {
    let filter = config.log_level.0;
    let layer = if config.log_format_json {
        tracing_subscriber::fmt::Layer::new()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_current_span(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::Layer::new()
            .with_target(true)
            .with_thread_names(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .error_context("A global tracing subscriber is already installed.")
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sluice_config::ConfigurationLoader;

    use super::*;

    fn from_values(values: serde_json::Value) -> Result<LoggingConfiguration, GenericError> {
        let config = ConfigurationLoader::default().with_values(values).into_generic();
        LoggingConfiguration::from_configuration(&config)
    }

    #[test]
    fn defaults() {
        let config = from_values(json!({})).unwrap();
        assert!(!config.log_format_json);
        assert_eq!(config.log_level.0.max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn explicit_values() {
        let config = from_values(json!({ "log_level": "debug", "log_format_json": "true" })).unwrap();
        assert!(config.log_format_json);
        assert_eq!(config.log_level.0.max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn empty_log_level_rejected() {
        assert!(from_values(json!({ "log_level": "  " })).is_err());
    }
}
