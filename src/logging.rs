// src/logging.rs

//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Level priority: `--log-level` flag, then the `DAGRUN_LOG` environment
//! variable, then `info`.

use std::str::FromStr;

use anyhow::Result;
use tracing_subscriber::fmt;

use crate::cli::LogLevel;

/// Initialise the global subscriber. Call once at startup; a second call
/// panics, which is why library code never calls this.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let level = cli_level.map(tracing::Level::from).unwrap_or_else(|| {
        std::env::var("DAGRUN_LOG")
            .ok()
            .and_then(|s| tracing::Level::from_str(s.trim()).ok())
            .unwrap_or(tracing::Level::INFO)
    });

    fmt()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    Ok(())
}

impl From<LogLevel> for tracing::Level {
    fn from(lvl: LogLevel) -> Self {
        match lvl {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}
