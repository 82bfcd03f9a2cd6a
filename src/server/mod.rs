//! Unix socket listener: accepts connections, reads one request per
//! connection, routes it, streams the response, closes.

use crate::db::Store;
use crate::error::{Error, Result};
use crate::journal::JournalReader;
use crate::proto;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub mod discover;
pub mod ingest;
pub mod query;

/// Timeout for the initial request line. Response streaming is not limited.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// How long in-flight connections may run after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared handles passed to every connection task.
#[derive(Clone)]
pub struct ServerState {
  pub store: Store,
  pub journal: JournalReader,
}

/// Bind the socket and serve until SIGTERM/SIGINT.
pub async fn serve(socket_path: &Path, state: ServerState) -> Result<()> {
  use std::os::unix::fs::PermissionsExt;

  prepare_socket_path(socket_path)?;
  let listener = UnixListener::bind(socket_path)?;
  // Filesystem permissions are the sole access control on this API.
  std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))?;
  info!(socket = %socket_path.display(), "listening");

  let mut sigterm = signal(SignalKind::terminate())?;
  let mut sigint = signal(SignalKind::interrupt())?;
  let mut connections: JoinSet<()> = JoinSet::new();

  loop {
    tokio::select! {
      accepted = listener.accept() => {
        match accepted {
          Ok((stream, _)) => {
            let state = state.clone();
            connections.spawn(async move { handle_client(state, stream).await });
          }
          Err(e) => warn!("accept failed: {e}"),
        }
      }
      Some(_) = connections.join_next(), if !connections.is_empty() => {}
      _ = sigterm.recv() => {
        info!("SIGTERM received, shutting down");
        break;
      }
      _ = sigint.recv() => {
        info!("SIGINT received, shutting down");
        break;
      }
    }
  }

  drop(listener);
  let _ = std::fs::remove_file(socket_path);

  let drain = async {
    while connections.join_next().await.is_some() {}
  };
  if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
    warn!("grace period elapsed, aborting remaining connections");
    connections.abort_all();
  }
  Ok(())
}

/// Create the socket directory with tight permissions and drop any stale
/// socket left by a previous run.
fn prepare_socket_path(path: &Path) -> Result<()> {
  use std::os::unix::fs::PermissionsExt;
  if let Some(parent) = path.parent() {
    if !parent.as_os_str().is_empty() && !parent.exists() {
      std::fs::create_dir_all(parent)?;
      let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o750));
    }
  }
  if path.exists() {
    std::fs::remove_file(path)?;
  }
  Ok(())
}

async fn handle_client(state: ServerState, stream: UnixStream) {
  let (read_half, mut writer) = stream.into_split();
  let mut reader = BufReader::new(read_half).take(proto::MAX_REQUEST_BYTES);
  let mut line = String::new();

  let n = match tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
    Ok(Ok(n)) => n,
    Ok(Err(e)) => {
      debug!("request read failed: {e}");
      return;
    }
    Err(_) => {
      debug!("request read timed out");
      return;
    }
  };
  if n == 0 {
    return;
  }
  if !line.ends_with('\n') && n as u64 >= proto::MAX_REQUEST_BYTES {
    let _ = writer.write_all(b"ERR bad-arguments\n").await;
    return;
  }

  if let Err(err) = dispatch(&state, line.trim(), &mut writer).await {
    respond_with_error(&err, &mut writer).await;
  }
  let _ = writer.shutdown().await;
}

async fn dispatch<W>(state: &ServerState, line: &str, writer: &mut W) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let request = proto::parse_request(line)?;
  debug!(verb = %request.verb, "dispatching request");
  match request.verb.as_str() {
    "PING" => writer.write_all(b"PONG\n").await?,
    "HEALTH" => writer.write_all(b"OK\n").await?,
    "VERSION" => {
      writer
        .write_all(concat!(env!("CARGO_PKG_VERSION"), "\n").as_bytes())
        .await?
    }
    "INGEST_JOURNAL" => ingest::handle(state, &request, writer).await?,
    "QUERY_LOGS" => query::handle(state, &request, writer).await?,
    "DISCOVER" => discover::handle(state, &request, writer).await?,
    _ => return Err(Error::UnknownCommand(request.verb)),
  }
  Ok(())
}

/// Translate an error into its wire form and log it at the level its kind
/// warrants. Client I/O errors mean the peer is gone: nothing to send.
async fn respond_with_error<W>(err: &Error, writer: &mut W)
where
  W: AsyncWrite + Unpin,
{
  let line = match err {
    Error::BadRequest(reason) => {
      debug!("bad request: {reason}");
      "ERR bad-arguments\n".to_string()
    }
    Error::UnknownCommand(verb) => {
      debug!("unknown command: {verb}");
      "ERR unknown-command\n".to_string()
    }
    Error::JournalUnavailable(reason) => {
      warn!("journal unavailable: {reason}");
      "ERR journal-unavailable\n".to_string()
    }
    Error::Storage(e) => {
      error!("storage error: {e}");
      let reason = e.to_string();
      format!("ERR storage: {}\n", reason.lines().next().unwrap_or("error"))
    }
    Error::Json(e) => {
      error!("row serialization failed: {e}");
      "ERR storage: row serialization failed\n".to_string()
    }
    Error::Io(e) => {
      debug!("client went away: {e}");
      return;
    }
  };
  let _ = writer.write_all(line.as_bytes()).await;
}
