//! Logging setup on top of `tracing`
//!
//! # Environment Variables
//!
//! - `BATCHFLOW_LOG_LEVEL`: simple level (error, warn, info, debug, trace)
//! - `BATCHFLOW_LOG_FORMAT`: output format ("human" or "json")
//! - `RUST_LOG`: standard filter, used when no level is set explicitly

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "BATCHFLOW_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "BATCHFLOW_LOG_FORMAT";

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Errors only
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Stage-level progress
    Info,
    /// Per-iteration events
    Debug,
    /// Everything, including per-copy events
    Trace,
}

impl LogLevel {
    /// Parse a level name
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Filter directive for this level
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Human,
    /// One JSON object per event
    Json,
}

impl LogFormat {
    /// Parse a format name
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is not set
    pub level: Option<LogLevel>,
    /// Output format
    pub format: LogFormat,
    /// Include thread names (stage workers are named)
    pub with_thread_names: bool,
}

impl LoggingConfig {
    /// Read `BATCHFLOW_LOG_LEVEL` and `BATCHFLOW_LOG_FORMAT`
    pub fn from_env() -> Self {
        Self {
            level: std::env::var(LOG_LEVEL_ENV).ok().and_then(|s| LogLevel::parse(&s)),
            format: std::env::var(LOG_FORMAT_ENV)
                .ok()
                .and_then(|s| LogFormat::parse(&s))
                .unwrap_or_default(),
            with_thread_names: true,
        }
    }

    /// Set the level
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = Some(level);
        self
    }

    /// Set the format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }
}

fn build_filter(level: Option<LogLevel>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::new(level.as_filter_str()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(LogLevel::default().as_filter_str())),
    }
}

/// Install the global subscriber. Idempotent; later calls are ignored, as
/// is a subscriber installed by someone else first.
pub fn init_logging(config: &LoggingConfig) {
    TRACING_INITIALIZED.get_or_init(|| {
        let filter = build_filter(config.level);
        let result = match config.format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_target(false)
                        .with_thread_names(config.with_thread_names),
                )
                .try_init(),
            LogFormat::Human => tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_thread_names(config.with_thread_names),
                )
                .try_init(),
        };
        // Another subscriber may already be installed
        let _ = result;
    });
}

/// Install the global subscriber configured from the environment
pub fn init_logging_from_env() {
    init_logging(&LoggingConfig::from_env());
}

/// Whether [`init_logging`] has run
pub fn is_logging_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("ERROR", Some(LogLevel::Error))]
    #[test_case("warning", Some(LogLevel::Warn))]
    #[test_case("trace", Some(LogLevel::Trace))]
    #[test_case("loud", None)]
    fn test_parse_level(input: &str, expected: Option<LogLevel>) {
        assert_eq!(LogLevel::parse(input), expected);
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("pretty"), Some(LogFormat::Human));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default().with_level(LogLevel::Debug);
        init_logging(&config);
        init_logging(&config.with_format(LogFormat::Json));
        assert!(is_logging_initialized());
    }
}
