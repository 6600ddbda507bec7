//! Tracing initialization.
//!
//! Logs go to stderr so the stdio transport keeps stdout for protocol frames.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Controls the log level and filtering. Examples:
//!   - `RUST_LOG=debug` - Enable debug logging for all modules
//!   - `RUST_LOG=imagegen_mcp=debug` - Enable debug for the server crate
//!   - `RUST_LOG=warn,imagegen_mcp::storage=debug` - Warn by default, debug for storage
//!
//! When `RUST_LOG` is unset the level configured as `SERVER__LOG_LEVEL` is used.

use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
    util::TryInitError,
};

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Try to initialize the global subscriber.
///
/// Returns an error instead of panicking if a subscriber is already set,
/// which happens when tests initialize tracing more than once.
///
/// # Example
///
/// ```
/// use imagegen_mcp_common::tracing::try_init_tracing;
///
/// let _ = try_init_tracing("debug");
/// tracing::info!("Server starting");
/// ```
pub fn try_init_tracing(default_level: &str) -> Result<(), TryInitError> {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_span_events(FmtSpan::NONE);

    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(fmt_layer)
        .try_init()
}
