//! Tracing subscriber setup.
//!
//! The level is controlled by `RUST_LOG` when it is set; otherwise by the
//! level passed in (the CLI's `--log-level`).
//!
//! ```bash
//! # Per-request details: parsed URLs, ignored headers, staged statuses
//! RUST_LOG=cadenza_core=debug cadenza 0.0.0.0 8080
//!
//! # Only capacity and syscall problems
//! RUST_LOG=warn cadenza 0.0.0.0 8080
//! ```
//!
//! Every `init_*` function installs a global subscriber and panics if one is
//! already installed. Call exactly one of them, once, at startup.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Output format for [`init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Compact single-line output.
    #[default]
    Plain,
    /// Multi-line, colourised, with thread ids and line numbers.
    Pretty,
    /// One JSON object per event, for log aggregation.
    Json,
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install a subscriber in the given format at the given default level.
pub fn init(format: LogFormat, level: &str) {
    match format {
        LogFormat::Plain => init_logging_with_level(level),
        LogFormat::Pretty => init_logging_pretty(level),
        LogFormat::Json => init_logging_json(level),
    }
}

/// Plain output at `info`.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Plain output at a specific level (`"trace"`, `"debug"`, `"info"`,
/// `"warn"` or `"error"`).
pub fn init_logging_with_level(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

pub fn init_logging_pretty(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_line_number(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_target(true),
        )
        .init();
}

pub fn init_logging_json(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().json().with_thread_names(true))
        .init();
}
