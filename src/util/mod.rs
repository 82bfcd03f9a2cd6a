//! Utility functions: tracing setup.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize logging. Verbosity comes from `CHIMERA_LOG_LEVEL` (falling back
/// to `RUST_LOG`, then `info`); `CHIMERA_LOG_FILE` redirects output to an
/// append-mode file instead of the terminal.
pub fn init_tracing() {
  let filter = std::env::var("CHIMERA_LOG_LEVEL")
    .ok()
    .map(EnvFilter::new)
    .or_else(|| EnvFilter::try_from_default_env().ok())
    .unwrap_or_else(|| EnvFilter::new("info"));

  match log_file() {
    Some(file) => fmt()
      .with_env_filter(filter)
      .with_target(false)
      .with_ansi(false)
      .with_writer(std::sync::Mutex::new(file))
      .init(),
    None => fmt()
      .with_env_filter(filter)
      .with_target(false)
      .pretty()
      .init(),
  }
}

fn log_file() -> Option<std::fs::File> {
  let path = std::env::var_os("CHIMERA_LOG_FILE")?;
  std::fs::OpenOptions::new()
    .create(true)
    .append(true)
    .open(path)
    .ok()
}
