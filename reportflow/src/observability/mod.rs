//! Process-wide tracing subscriber setup.
//!
//! Components log through `tracing` macros and report structured events to
//! an injected [`EventSink`](crate::events::EventSink); this module only
//! installs the subscriber those macros write to, once, at the binary edge.

use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::errors::{ReportflowError, Result};

fn default_level() -> String {
    "info".to_string()
}

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directives used when `RUST_LOG` is not set, e.g. `info` or
    /// `reportflow=debug,warn`.
    pub level: String,
    /// Line format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

/// Builds the filter: `env_directives` (normally `RUST_LOG`) win over the
/// configured level.
pub fn build_filter(config: &LoggingConfig, env_directives: Option<&str>) -> Result<EnvFilter> {
    if let Some(directives) = env_directives.filter(|d| !d.trim().is_empty()) {
        if let Ok(filter) = EnvFilter::try_new(directives) {
            return Ok(filter);
        }
    }
    EnvFilter::try_new(&config.level).map_err(|err| {
        ReportflowError::configuration(format!(
            "logging.level '{}' is invalid: {err}",
            config.level
        ))
    })
}

/// Installs the global subscriber.
///
/// Fails if a subscriber is already installed or the level is invalid.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(config, env_directives.as_deref())?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(false)).try_init(),
    };
    installed.map_err(|err| ReportflowError::Internal(format!("tracing subscriber: {err}")))
}
