//! `tracing` subscriber wiring for the binary.
//!
//! The long-running service logs twice: newline-delimited JSON into a
//! daily-rotated file under the logs directory, and plain text on stderr.
//! One-shot commands such as `sessions` and `check-config` only get stderr.
//! `RUST_LOG` overrides [`DEFAULT_FILTER`] in both cases.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// File name prefix of the rotated JSON log; the appender adds the date.
pub const LOG_FILE_PREFIX: &str = "switchboard.log";

/// Directives used when `RUST_LOG` is unset. Per-query sqlx logging is
/// too chatty at `info`.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn";

/// Keeps the background file writer alive. Log lines still buffered are
/// written out when this drops, so hold it until the service exits.
pub struct LoggingGuard {
    _writer: WorkerGuard,
}

impl std::fmt::Debug for LoggingGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingGuard").finish_non_exhaustive()
    }
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the service subscriber: JSON into
/// `{logs_dir}/switchboard.log.YYYY-MM-DD` plus stderr.
///
/// If another subscriber already owns the global slot it keeps it; the
/// returned guard then only flushes an unused writer.
///
/// # Errors
///
/// Fails when `logs_dir` cannot be created.
pub fn init_production(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX));

    let installed = tracing_subscriber::registry()
        .with(filter())
        .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
    if installed.is_err() {
        tracing::debug!("global subscriber already installed");
    }

    Ok(LoggingGuard { _writer: guard })
}

/// Stderr-only subscriber for short operator commands.
pub fn init_cli() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .try_init();
}
