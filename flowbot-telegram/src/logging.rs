//! Tracing initialization for adapter deployments.

use anyhow::Context as _;
use tracing_subscriber::prelude::*;

use crate::config::Config;

/// Default tracing directives enabling info-level logs for this crate and
/// flowbot-core.
const DEFAULT_DIRECTIVES: &[&str] = &["flowbot_telegram=info", "flowbot_core=info"];

/// Build the default `EnvFilter`: RUST_LOG (if set) plus our default directives.
fn default_env_filter() -> anyhow::Result<tracing_subscriber::EnvFilter> {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in DEFAULT_DIRECTIVES {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

/// Initialize the tracing subscriber.
///
/// When `config.logging` is `Some`, creates a layered subscriber with both
/// stdout and rolling file output. When `None`, uses stdout-only.
///
/// Returns the non-blocking writer guard that must be held for the process
/// lifetime.
///
/// # Errors
///
/// Returns an error when the filter directives fail to parse or the file
/// appender cannot be built.
pub fn init_tracing(
    config: &Config,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    if let Some(ref lc) = config.logging {
        // Attempt to create the log directory; fall back to stdout-only on failure.
        if let Err(e) = std::fs::create_dir_all(&lc.directory) {
            eprintln!(
                "Warning: Failed to create log directory '{}': {}. Falling back to stdout-only.",
                lc.directory, e
            );
            tracing_subscriber::fmt()
                .with_env_filter(default_env_filter()?)
                .init();
            return Ok(None);
        }

        // Map rotation string to the tracing-appender rotation type.
        let rotation = match lc.rotation.as_str() {
            "daily" => tracing_appender::rolling::Rotation::DAILY,
            "hourly" => tracing_appender::rolling::Rotation::HOURLY,
            "never" => tracing_appender::rolling::Rotation::NEVER,
            other => {
                eprintln!(
                    "Warning: Unknown rotation '{}', falling back to daily",
                    other
                );
                tracing_appender::rolling::Rotation::DAILY
            }
        };

        // Build the rolling file appender.
        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(rotation)
            .filename_prefix("flowbot")
            .filename_suffix("log")
            .max_log_files(lc.max_files)
            .build(&lc.directory)
            .context("Failed to create rolling file appender")?;

        // Wrap in a non-blocking writer; guard must be kept alive for the process lifetime.
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let env_filter = default_env_filter()?;

        let stdout_layer = tracing_subscriber::fmt::layer();

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout_layer)
            .with(file_layer)
            .init();

        Ok(Some(guard))
    } else {
        // No [logging] section — stdout only.
        tracing_subscriber::fmt()
            .with_env_filter(default_env_filter()?)
            .init();
        Ok(None)
    }
}
