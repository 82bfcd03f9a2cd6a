use std::process::ExitCode;

const USAGE: &str = "\
Usage: chimerad [--version]

Serves the log analytics API on a Unix domain socket. There are no flags to
tune; configuration comes from the environment: CHIMERA_API_SOCKET,
CHIMERA_DB_PATH, CHIMERA_LOG_LEVEL, CHIMERA_LOG_FILE.";

#[tokio::main]
async fn main() -> ExitCode {
  if let Some(arg) = std::env::args().nth(1) {
    return match arg.as_str() {
      "--version" | "-V" => {
        println!("chimerad {}", env!("CARGO_PKG_VERSION"));
        ExitCode::SUCCESS
      }
      "--help" | "-h" => {
        eprintln!("{USAGE}");
        ExitCode::SUCCESS
      }
      other => {
        eprintln!("chimerad: unrecognized argument {other:?}");
        eprintln!("{USAGE}");
        ExitCode::from(2)
      }
    };
  }

  match chimera::app::run().await {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      eprintln!("chimerad: {e}");
      ExitCode::FAILURE
    }
  }
}
