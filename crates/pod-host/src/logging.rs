//! Logging setup for embedders and test binaries.
//!
//! Library code only emits `tracing` events; installing a subscriber is the
//! embedder's choice, and this helper is one reasonable way to do it.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// JSONL on stderr, for programmatic consumers.
    Json,
    /// Plain text with no colors.
    Text,
    /// Plain text with colors, for interactive terminals.
    Color,
}

fn default_log_format() -> LogFormat {
    if atty::is(atty::Stream::Stderr) {
        LogFormat::Color
    } else {
        LogFormat::Json
    }
}

/// Initializes logging. `level` is an env-filter directive such as "warn" or
/// "pod_host=debug". Panics if a subscriber is already installed.
pub fn init_logging(level: &str, format: Option<LogFormat>) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(level)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_target(false);

    match format.unwrap_or_else(default_log_format) {
        LogFormat::Json => {
            builder
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .init();
        }
        LogFormat::Text => {
            builder.compact().with_ansi(false).init();
        }
        LogFormat::Color => {
            builder.compact().with_ansi(true).init();
        }
    }
}
