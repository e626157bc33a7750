//! Tracing subscriber setup.
//!
//! Console output goes to stderr (pretty or JSON) so it never mixes with the
//! CLI's stdout results. When a log directory is configured, a second JSON
//! layer writes to a daily-rolling file through a non-blocking appender.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::paperflow_config::{LogFormat, LoggingSection};

const LOG_FILE_PREFIX: &str = "paperflow.log";

/// Filter from `RUST_LOG` when set, else the configured level (`debug` when
/// `verbose`).
pub fn build_filter(logging: &LoggingSection, verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if verbose { "debug" } else { logging.level.as_str() };
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// Returns the file appender's guard, which must be kept alive for buffered
/// lines to be flushed. A second call is a no-op.
pub fn init_logging(logging: &LoggingSection, verbose: bool) -> Result<Option<WorkerGuard>> {
    let console = match logging.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(verbose)
            .compact()
            .with_filter(build_filter(logging, verbose))
            .boxed(),
        LogFormat::Json => fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .with_filter(build_filter(logging, verbose))
            .boxed(),
    };

    let (file_layer, guard) = match &logging.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .json()
                .with_filter(build_filter(logging, verbose))
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    if tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already set, keeping it");
        return Ok(None);
    }

    tracing::debug!(
        level = %logging.level,
        format = %logging.format,
        dir = ?logging.dir,
        "Logging initialised"
    );
    Ok(guard)
}
