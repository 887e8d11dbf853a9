//! Tracing subscriber setup: stderr plus a daily-rotated log file.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. `RUST_LOG`, when set, overrides `level`.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// whole run. Returns `None` for the guard if the log directory could not be
/// created, in which case only stderr logging is installed.
pub fn init(level: &str, dir: &Path, file_prefix: &str) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},reqwest=warn,hyper=warn", level)));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    match std::fs::create_dir_all(dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(dir, file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
                .ok();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .try_init()
                .ok();
            tracing::warn!(dir = %dir.display(), "file logging disabled: {}", e);
            None
        }
    }
}
