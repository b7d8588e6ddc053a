//! Tracing subscriber setup shared by both binaries.
//!
//! Output always goes to stderr. The supervisor runs in front of an
//! interactive prompt, so its default level is `warn`; the keeper runs under
//! a service manager whose journal captures everything at `info`.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Environment variable holding the filter directive.
pub const LOG_ENV: &str = "GUARDIAN_LOG";

/// Environment variable selecting the output format (`pretty` or `json`).
pub const LOG_FORMAT_ENV: &str = "GUARDIAN_LOG_FORMAT";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    /// Parse a format name; unknown names fall back to pretty.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Logging settings for one binary.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directive used when neither `GUARDIAN_LOG` nor `RUST_LOG` is set.
    pub default_directive: String,
    pub format: LogFormat,
    /// Include span/target metadata (keeper) or keep lines terse (supervisor).
    pub with_target: bool,
}

impl LogConfig {
    /// Quiet defaults for the launch path.
    #[must_use]
    pub fn supervisor() -> Self {
        Self {
            default_directive: "warn".to_string(),
            format: format_from_env(),
            with_target: false,
        }
    }

    /// Verbose defaults for the integrity monitor.
    #[must_use]
    pub fn keeper() -> Self {
        Self {
            default_directive: "info".to_string(),
            format: format_from_env(),
            with_target: true,
        }
    }
}

fn format_from_env() -> LogFormat {
    std::env::var(LOG_FORMAT_ENV)
        .map(|v| LogFormat::from_name(&v))
        .unwrap_or_default()
}

/// Build the filter: `GUARDIAN_LOG`, then `RUST_LOG`, then the default.
#[must_use]
pub fn build_filter(default_directive: &str) -> EnvFilter {
    let directive = std::env::var(LOG_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| std::env::var("RUST_LOG").ok().filter(|v| !v.trim().is_empty()));
    match directive {
        Some(d) => EnvFilter::try_new(&d).unwrap_or_else(|_| EnvFilter::new(default_directive)),
        None => EnvFilter::new(default_directive),
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed; callers treat
/// that as non-fatal.
pub fn init_logging(config: &LogConfig) -> bool {
    let filter = build_filter(&config.default_directive);
    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(config.with_target),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(config.with_target),
            )
            .try_init(),
    };
    result.is_ok()
}
