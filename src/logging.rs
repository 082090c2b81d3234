//! Tracing subscriber setup.

use anyhow::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

use crate::stagehand_config::{ENV_LOG, LoggingSection};

/// Filter from `STAGEHAND_LOG`, then `RUST_LOG`, then the configured level.
pub fn env_filter(default_level: &str, verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_env(ENV_LOG) {
        return filter;
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if verbose { "debug" } else { default_level };
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber: stderr output plus an optional
/// daily-rolling file under `log_dir`. Keep the returned guard alive until
/// exit so buffered file lines are flushed.
pub fn init(
    settings: &LoggingSection,
    log_dir: Option<&Path>,
    verbose: bool,
) -> Result<Option<WorkerGuard>> {
    let stderr_layer = if settings.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(env_filter(&settings.level, verbose))
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(env_filter(&settings.level, verbose))
            .boxed()
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) if settings.file => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "stagehand.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(env_filter(&settings.level, verbose))
                .boxed();
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    // a second init (tests, embedding) keeps the first subscriber
    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .ok();

    Ok(guard)
}
