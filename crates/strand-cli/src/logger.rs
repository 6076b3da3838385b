//! Logging setup for the `strand` binary
//!
//! Library crates only emit `tracing` events; this is the one place a
//! subscriber is installed. `RUST_LOG`, when set, takes precedence over
//! `--log-level`.

use clap::ValueEnum;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::default().add_directive(LevelFilter::from_level(level.into()).into())
    });

    let layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .with_filter(filter);

    let _ = Registry::default().with(layer).try_init();
}
