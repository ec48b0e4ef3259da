//! Logging initialisation for the launcher and its helper binaries.
//!
//! Stderr output is always on, filtered by `RUST_LOG` (default `info`). When
//! a log directory is given, the same events are also appended to
//! `<dir>/launcher.log` without ANSI colours.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_NAME: &str = "launcher.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main` and keep the returned `LogGuard` alive. A second call
/// in the same process is ignored.
pub fn init(log_dir: Option<&Path>) -> LogGuard {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_guard = match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

            let _ = tracing_subscriber::registry()
                .with(filter())
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(file_layer)
                .try_init();

            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter())
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init();

            None
        }
    };

    LogGuard {
        _file_guard: file_guard,
    }
}
