//! Logging setup.
//!
//! Structured `tracing` output goes to stderr (so command stdout stays
//! parseable) and to a daily rolling file under `.convoy/logs/`. The filter
//! comes from `CONVOY_LOG`, defaulting to `info`, or `debug` with `--verbose`.

use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "CONVOY_LOG";

const LOG_FILE_PREFIX: &str = "convoy.log";

/// Keeps the file writer alive; dropping it flushes the log file.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Filter from `CONVOY_LOG`, falling back to `info` / `debug`.
pub fn env_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. With `log_dir` set, a rolling file layer
/// is added; if the directory cannot be created only stderr is used.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> LoggingGuard {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .compact();

    let (file_layer, file_guard) = match log_dir {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    // A second init (e.g. in tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    LoggingGuard {
        _file_guard: file_guard,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_creates_log_dir_and_tolerates_reinit() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join(".convoy/logs");
        let _guard = init(false, Some(&log_dir));
        assert!(log_dir.is_dir());
        let _again = init(true, None);
    }
}
