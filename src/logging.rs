//! Tracing setup shared by the service and the status listener.
//!
//! Every binary logs compactly to stdout and to its own daily-rolled file,
//! `<REELINDEX_LOG_DIR or logs>/<component>.log.<date>`, so the service and the listener never
//! interleave in one file. `RUST_LOG` replaces [`DEFAULT_DIRECTIVES`] entirely. The file layer
//! also records `job` span closes, which gives one line per processed delivery with its timing.
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter used when `RUST_LOG` is unset: worker transitions at debug, AMQP client chatter
/// only when it warns.
pub const DEFAULT_DIRECTIVES: &str =
    "info,reelindex::ingest::worker=debug,lapin=warn,pinky_swear=warn";

const LOG_DIR_VAR: &str = "REELINDEX_LOG_DIR";
const DEFAULT_LOG_DIR: &str = "logs";

/// Keeps the file writer flushing; drop it only when the process is about to exit.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber for the binary named `component`.
pub fn init_tracing(component: &str) -> LogGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    let stdout_layer = fmt::layer().with_target(false).compact();

    let (file_layer, guard) = match file_writer(&log_dir(), component) {
        Some((writer, guard)) => {
            let layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .with_span_events(FmtSpan::CLOSE)
                .compact();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
    LogGuard { _file: guard }
}

fn log_dir() -> PathBuf {
    std::env::var(LOG_DIR_VAR)
        .ok()
        .filter(|dir| !dir.trim().is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_LOG_DIR), PathBuf::from)
}

/// Non-blocking writer over `<dir>/<component>.log.<date>`, or `None` when the directory is
/// unusable. Runs before the subscriber exists, so failures go to stderr.
fn file_writer(dir: &Path, component: &str) -> Option<(NonBlocking, WorkerGuard)> {
    if let Err(err) = std::fs::create_dir_all(dir) {
        eprintln!("Failed to create log directory {}: {err}", dir.display());
        return None;
    }
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(format!("{component}.log"))
        .build(dir);
    match appender {
        Ok(appender) => Some(tracing_appender::non_blocking(appender)),
        Err(err) => {
            eprintln!("Failed to open log file in {}: {err}", dir.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_parse() {
        assert!(EnvFilter::try_new(DEFAULT_DIRECTIVES).is_ok());
    }

    #[test]
    fn each_component_gets_its_own_file() {
        let dir = std::env::temp_dir().join(format!("reelindex-logs-{}", uuid::Uuid::new_v4()));
        let service = file_writer(&dir, "reelindex");
        let listener = file_writer(&dir, "status-listener");
        assert!(service.is_some());
        assert!(listener.is_some());

        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .expect("log dir")
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names[0].starts_with("reelindex.log."));
        assert!(names[1].starts_with("status-listener.log."));

        drop((service, listener));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
