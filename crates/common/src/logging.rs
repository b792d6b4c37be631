//! Logging utilities shared by the health controller binaries and tests.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl LogFormat {
    /// Parse a configured format name. Anything but `json` is plain text.
    pub fn from_name(name: Option<&str>) -> Self {
        match name.map(str::to_ascii_lowercase).as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Plain,
        }
    }
}

/// Build the env filter, letting `RUST_LOG` override the configured level.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize tracing with plain text output.
///
/// Uses the RUST_LOG environment variable to control log levels,
/// falling back to `level`.
pub fn init(level: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter(level))
        .init();
}

/// Initialize tracing with JSON formatting (useful for structured logging).
pub fn init_json(level: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(env_filter(level))
        .init();
}

/// Best-effort subscriber for tests; ignores "already set" errors.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(env_filter("debug"))
        .try_init();
}
