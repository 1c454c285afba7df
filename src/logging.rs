//! Structured logging initialization.
//!
//! Configures the tracing subscriber. The RUST_LOG environment variable
//! takes precedence over configuration file settings.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize the logging subsystem.
///
/// If RUST_LOG is not set, the level from config is used. Call once, early;
/// a second call fails quietly (some test harness already installed a
/// subscriber).
pub fn init(config: &LoggingConfig) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => {
            let subscriber = tracing_subscriber::registry().with(filter).with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(config.target)
                    .with_thread_names(config.thread_names),
            );
            let _ = subscriber.try_init();
        }
        (LogFormat::Pretty, false) => {
            let subscriber = tracing_subscriber::registry().with(filter).with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(config.target)
                    .with_thread_names(config.thread_names)
                    .without_time(),
            );
            let _ = subscriber.try_init();
        }
        (LogFormat::Compact, true) => {
            let subscriber = tracing_subscriber::registry().with(filter).with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(config.target)
                    .with_thread_names(config.thread_names),
            );
            let _ = subscriber.try_init();
        }
        (LogFormat::Compact, false) => {
            let subscriber = tracing_subscriber::registry().with(filter).with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(config.target)
                    .with_thread_names(config.thread_names)
                    .without_time(),
            );
            let _ = subscriber.try_init();
        }
        (LogFormat::Json, true) => {
            let subscriber = tracing_subscriber::registry().with(filter).with(
                fmt::layer()
                    .json()
                    .with_target(config.target)
                    .with_thread_names(config.thread_names),
            );
            let _ = subscriber.try_init();
        }
        (LogFormat::Json, false) => {
            let subscriber = tracing_subscriber::registry().with(filter).with(
                fmt::layer()
                    .json()
                    .with_target(config.target)
                    .with_thread_names(config.thread_names)
                    .without_time(),
            );
            let _ = subscriber.try_init();
        }
    }
}
