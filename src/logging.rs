use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing subscriber.
///
/// Logs go to stderr, filtered by `RUST_LOG` (default `info`). When `log_dir`
/// can be created, a daily rolling file is written there as well; keep the
/// returned guard alive so buffered lines get flushed.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let (file_layer, guard) = match log_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok()) {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "caseificio.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_ansi(false).with_writer(writer)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(file_layer)
    .with(filter)
    .init();

  guard
}
