//! Tracing setup.
//!
//! stdout and stderr are the very streams this crate captures, so logs go to a
//! daily-rolling file through a non-blocking appender and never to a terminal.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const APP_NAME: &str = "iopub";
const LOG_DIR: &str = "logs";
const LOG_FILE: &str = "iopub.log";

pub struct LoggingGuard {
    _guard: WorkerGuard,
    log_dir: PathBuf,
}

impl LoggingGuard {
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

/// Platform data directory for logs.
pub fn default_log_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME").ok().map(|home| {
            PathBuf::from(home)
                .join("Library/Logs")
                .join(APP_NAME)
        })
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
            Some(PathBuf::from(xdg).join(APP_NAME).join(LOG_DIR))
        } else {
            std::env::var("HOME").ok().map(|home| {
                PathBuf::from(home)
                    .join(".local/state")
                    .join(APP_NAME)
                    .join(LOG_DIR)
            })
        }
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
///
/// Returns `None` if no log directory is usable or a subscriber is already set.
pub fn init(log_dir: Option<&Path>, default_filter: &str) -> Option<LoggingGuard> {
    let log_dir = log_dir
        .map(Path::to_path_buf)
        .or_else(default_log_dir)
        .and_then(|dir| std::fs::create_dir_all(&dir).ok().map(|_| dir))
        .or_else(|| {
            let dir = std::env::temp_dir().join(APP_NAME).join(LOG_DIR);
            std::fs::create_dir_all(&dir).ok().map(|_| dir)
        })?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = tracing_subscriber::registry().with(env_filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true),
    );

    if subscriber.try_init().is_err() {
        return None;
    }

    std::panic::set_hook(Box::new(|panic_info| {
        tracing::error!(panic = %panic_info, "panic");
    }));

    tracing::info!(log_dir = %log_dir.display(), pid = std::process::id(), "tracing initialized");

    Some(LoggingGuard {
        _guard: guard,
        log_dir,
    })
}
