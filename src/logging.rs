//! Diagnostic logging setup using `tracing-subscriber`.
//!
//! Everything goes to stderr so stdout stays free for machine-readable
//! reports. Verbosity is controlled by `RUST_LOG` (default: `info`).
//!
//! This is operator-facing diagnostics only; the tamper-evident record of
//! installs lives in [`crate::integrity::audit`].

use tracing_subscriber::EnvFilter;

/// Output format for diagnostic logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line, for log shippers.
    Json,
}

/// Initialise stderr logging for a one-shot command.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_cli(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if result.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}
