//! Logging infrastructure for ccload-core
//!
//! The gateway logs to stdout; set `CCLOAD_LOG_DIR` to also write a
//! daily-rotated file through a non-blocking appender.

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Optional log directory for the rolling file appender
pub const ENV_LOG_DIR: &str = "CCLOAD_LOG_DIR";

/// Initialize the logging system.
///
/// Level comes from `RUST_LOG`, defaulting to `info`. Returns a guard that
/// must be kept alive for the lifetime of the process so buffered file
/// writes are flushed on shutdown.
pub fn init() -> crate::error::Result<LoggingGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = fmt::layer().with_target(true);

    let file_guard = match std::env::var(ENV_LOG_DIR) {
        Ok(dir) if !dir.is_empty() => {
            std::fs::create_dir_all(&dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, &dir, "ccload.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true);

            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();

            tracing::info!(log_dir = %dir, "Logging initialized with file output");
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .init();
            None
        }
    };

    Ok(LoggingGuard {
        _guard: file_guard,
    })
}

/// Initialize logging for tests (logs to the test writer)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Guard that keeps the logging system alive.
///
/// When dropped, flushes any pending file writes.
pub struct LoggingGuard {
    _guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}
