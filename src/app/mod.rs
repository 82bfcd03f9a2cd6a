//! Application setup and runtime.

use crate::db::Store;
use crate::journal::JournalReader;
use crate::server::{self, ServerState};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DEFAULT_SOCKET_PATH: &str = "/run/chimera/api.sock";
pub const SERVICE_DB_DIR: &str = "/var/lib/chimera";

/// Runtime paths resolved from the environment.
#[derive(Debug, Clone)]
pub struct Config {
  pub socket_path: PathBuf,
  pub db_path: PathBuf,
}

impl Config {
  pub fn from_env() -> Self {
    let socket_path = std::env::var_os("CHIMERA_API_SOCKET")
      .map(PathBuf::from)
      .unwrap_or_else(default_socket_path);
    let db_path = std::env::var_os("CHIMERA_DB_PATH")
      .map(PathBuf::from)
      .unwrap_or_else(default_db_path);
    Self {
      socket_path,
      db_path,
    }
  }
}

/// Start the daemon: logging, store, then the socket listener. Any error here
/// is startup-fatal and the process exits non-zero.
pub async fn run() -> Result<(), crate::error::Error> {
  crate::util::init_tracing();
  let config = Config::from_env();
  info!(db = %config.db_path.display(), "opening analytic store");
  let store = Store::open(&config.db_path).await?;
  let state = ServerState {
    store,
    journal: JournalReader::from_env(),
  };
  server::serve(&config.socket_path, state).await
}

/// `/run/chimera/api.sock` when that directory can be used, else a per-user
/// path under the system temp directory.
fn default_socket_path() -> PathBuf {
  let standard = PathBuf::from(DEFAULT_SOCKET_PATH);
  if let Some(parent) = standard.parent() {
    if dir_usable(parent) {
      return standard;
    }
  }
  let user = std::env::var("USER").unwrap_or_else(|_| "default".to_string());
  let fallback = std::env::temp_dir().join(format!("chimera-{user}"));
  warn!(
    "socket directory {} not writable, falling back to {}",
    DEFAULT_SOCKET_PATH,
    fallback.display()
  );
  fallback.join("api.sock")
}

/// `/var/lib/chimera/chimera.db` under a service install, else a local
/// `data/` path for ad-hoc runs.
fn default_db_path() -> PathBuf {
  let service_dir = Path::new(SERVICE_DB_DIR);
  if service_dir.is_dir() {
    return service_dir.join("chimera.db");
  }
  PathBuf::from("data/chimera.db")
}

fn dir_usable(dir: &Path) -> bool {
  if std::fs::create_dir_all(dir).is_err() {
    return false;
  }
  let probe = dir.join(".chimera-probe");
  match std::fs::OpenOptions::new()
    .create(true)
    .write(true)
    .open(&probe)
  {
    Ok(_) => {
      let _ = std::fs::remove_file(&probe);
      true
    }
    Err(_) => false,
  }
}
