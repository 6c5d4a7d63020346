//! Tracing setup: console plus the two log files served to the debug user.

use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const WARNING_LOG: &str = "warning.log";
const INFO_LOG: &str = "info.log";

/// Locations of the log files
#[derive(Debug, Clone)]
pub struct LogFiles {
    pub dir: PathBuf,
    pub warning: PathBuf,
    pub info: PathBuf,
}

impl LogFiles {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            warning: dir.join(WARNING_LOG),
            info: dir.join(INFO_LOG),
        }
    }
}

/// Keeps the non-blocking file writers flushing; drop only at exit
pub struct LogGuard {
    _warning: WorkerGuard,
    _info: WorkerGuard,
}

pub fn init(files: &LogFiles) -> anyhow::Result<LogGuard> {
    std::fs::create_dir_all(&files.dir)
        .with_context(|| format!("Failed to create log directory {}", files.dir.display()))?;

    let (warning_writer, warning_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&files.dir, WARNING_LOG));
    let (info_writer, info_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&files.dir, INFO_LOG));

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "support_bot=info".into()),
        )
        .with(fmt::layer().with_filter(LevelFilter::INFO))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(warning_writer)
                .with_filter(LevelFilter::WARN),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(info_writer)
                .with_filter(LevelFilter::INFO),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogGuard {
        _warning: warning_guard,
        _info: info_guard,
    })
}
