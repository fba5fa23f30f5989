//! Logging setup on top of `tracing-subscriber`.
//!
//! Supports human-readable and JSON output; the latter is meant for log
//! aggregation when several trainer processes write to one sink.

use tracing_subscriber::{fmt, EnvFilter};

/// Logging format options
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogFormat {
    /// Human-readable format (default)
    Pretty,
    /// One JSON object per event
    Json,
    /// Compact single-line format
    Compact,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// Initialize logging with the default pretty format.
pub fn init_logging() {
    init_logging_with_format(LogFormat::Pretty);
}

/// Initialize logging with the specified format.
///
/// `RUST_LOG` controls the level filter, `info` when unset. Calling this a
/// second time in one process is a no-op.
pub fn init_logging_with_format(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match format {
        LogFormat::Pretty => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .try_init(),
        LogFormat::Json => fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .flatten_event(true)
            .try_init(),
        LogFormat::Compact => fmt()
            .with_env_filter(filter)
            .compact()
            .with_target(false)
            .try_init(),
    };

    if let Err(err) = result {
        eprintln!("logging already initialized: {err}");
    }
}

/// Initialize logging from `REPLICA_LOG_FORMAT` (`json`, `compact`, anything
/// else means pretty).
pub fn init_logging_from_env() {
    let format = std::env::var("REPLICA_LOG_FORMAT")
        .map(|s| LogFormat::parse(&s))
        .unwrap_or(LogFormat::Pretty);

    init_logging_with_format(format);
}
