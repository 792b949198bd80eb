//! Structured logging infrastructure for Meshward.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line output
    #[default]
    Plain,
    /// One JSON object per record, for log aggregation
    Json,
}

impl LogFormat {
    /// Parse a format name, falling back to `Plain` for anything unrecognized.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Plain,
        }
    }
}

fn filter(default_level: &str) -> EnvFilter {
    let from_env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    build_filter(from_env.as_deref(), default_level)
}

/// `RUST_LOG` directives when present and valid, `default_level` otherwise.
fn build_filter(directives: Option<&str>, default_level: &str) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(default_level))
}

/// Initialize the logging system with structured output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, `default_level` is used.
///
/// # Example
/// ```no_run
/// use meshward_core::logging;
///
/// logging::init("info");
/// tracing::info!("Bridge started");
/// ```
pub fn init(default_level: &str) {
    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Initialize the logging system with JSON output for production environments.
///
/// # Example
/// ```no_run
/// use meshward_core::logging;
///
/// logging::init_json("info");
/// tracing::info!(service = "bridge", "Service started");
/// ```
pub fn init_json(default_level: &str) {
    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .init();
}

/// Initialize logging in the requested format.
pub fn init_with_format(format: LogFormat, default_level: &str) {
    match format {
        LogFormat::Plain => init(default_level),
        LogFormat::Json => init_json(default_level),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::parse("plain"), LogFormat::Plain);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Plain);
    }

    #[test]
    fn test_filter_falls_back_to_default_level() {
        assert_eq!(build_filter(None, "debug").to_string(), "debug");
        assert_eq!(build_filter(Some("  "), "warn").to_string(), "warn");
        assert_eq!(build_filter(Some("meshward=notalevel"), "warn").to_string(), "warn");
    }

    #[test]
    fn test_env_directives_win_over_default() {
        let filter = build_filter(Some("meshward_bridge=trace"), "info");
        assert_eq!(filter.to_string(), "meshward_bridge=trace");
    }
}
