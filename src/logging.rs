//! Tracing subscriber setup.
//!
//! Plugins must keep standard output free for the handshake line, so events
//! go to standard error unless `logging.file` names a file. File output uses
//! a non-blocking writer whose guard lives for the rest of the process.

use std::io;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Environment variable that overrides `logging.level`.
pub const LOG_LEVEL_ENV: &str = "DBPLUGIN_LOG";

/// Install the global subscriber. Later calls are no-ops.
pub fn init(config: &LoggingConfig) -> io::Result<()> {
    let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| config.level.clone());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = config.format == "json";

    let writer = match &config.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let _ = LOG_GUARD.set(guard);
            non_blocking
        }
        None => {
            let (non_blocking, guard) = tracing_appender::non_blocking(io::stderr());
            let _ = LOG_GUARD.set(guard);
            non_blocking
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_thread_ids(true)
        .with_writer(writer);

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if json {
        Box::new(builder.json().with_env_filter(filter).finish())
    } else {
        Box::new(builder.compact().with_env_filter(filter).finish())
    };

    let _ = tracing::subscriber::set_global_default(subscriber);
    Ok(())
}
