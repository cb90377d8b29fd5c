use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes logging with console output and a daily-rolling JSON file under `log_dir`.
///
/// Fails before any subscriber is installed if `log_dir` cannot be created.
/// The returned guard flushes the file writer when dropped; keep it alive for
/// the lifetime of the process.
pub fn init_logging(log_dir: &Path) -> io::Result<WorkerGuard> {
    fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "moneyplot.log");
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);
    let console_layer = fmt::layer().with_writer(std::io::stdout);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("moneyplot=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    Ok(guard)
}
