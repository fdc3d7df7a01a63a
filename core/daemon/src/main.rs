//! Playtime daemon entrypoint.
//!
//! A single-writer service that owns the playtime ledger. Clients talk to it
//! over a unix socket, one JSON request and one JSON response per connection.
//! Live sessions are kept in memory and flushed periodically and on shutdown.

use clap::Parser;
use fs_err as fs;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use playtime_core::{Ledger, SessionTracker, SystemClock};
use playtime_daemon_protocol::{ErrorInfo, Request, Response, MAX_REQUEST_BYTES};

mod config;
mod handlers;
mod lifecycle;
mod logging;
mod state;

use config::{DaemonConfig, Overrides};
use state::DaemonState;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

#[derive(Parser)]
#[command(name = "playtimed")]
#[command(about = "Playtime accounting daemon")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.playtime/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ledger database path
    #[arg(long)]
    db: Option<PathBuf>,

    /// Unix socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Log to this file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let (mut config, config_error) = match config::load_config(cli.config) {
        Ok(config) => (config, None),
        Err(err) => (DaemonConfig::default(), Some(err)),
    };
    config.apply_overrides(Overrides {
        db: cli.db,
        socket: cli.socket,
        log_file: cli.log_file,
    });

    let log_file = if config.logging.stdout {
        None
    } else {
        config.log_file_path().ok()
    };
    let _log_guard = logging::init(config.logging.stdout, log_file.as_deref());

    if let Some(err) = config_error {
        warn!(error = %err, "Failed to load config; using defaults");
    }

    let ledger_path = match config.ledger_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve ledger path");
            std::process::exit(1);
        }
    };

    let ledger = match Ledger::open(&ledger_path) {
        Ok(ledger) => Arc::new(ledger),
        Err(err) => {
            error!(error = %err, path = %ledger_path.display(), "Failed to open ledger");
            std::process::exit(1);
        }
    };

    let tracker =
        match SessionTracker::with_clock(ledger, Arc::new(SystemClock), config.tracker_config()) {
            Ok(tracker) => tracker,
            Err(err) => {
                error!(error = %err, "Failed to start session tracker");
                std::process::exit(1);
            }
        };

    let socket_path = match config.socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    let shared_state = Arc::new(DaemonState::new(
        tracker,
        config.tracker.snapshot_interval_secs,
    ));

    if let Err(err) =
        lifecycle::spawn_signal_handler(Arc::clone(&shared_state), socket_path.clone())
    {
        error!(error = %err, "Failed to install signal handler");
        lifecycle::shutdown(&shared_state);
        let _ = fs::remove_file(&socket_path);
        std::process::exit(1);
    }
    lifecycle::spawn_snapshot_scheduler(Arc::clone(&shared_state));

    info!(
        socket = %socket_path.display(),
        ledger = %ledger_path.display(),
        snapshot_interval_secs = config.tracker.snapshot_interval_secs,
        max_in_flight_merges = config.tracker.max_in_flight_merges,
        "Playtime daemon started"
    );

    for stream in listener.incoming() {
        if shared_state.is_exiting() {
            break;
        }
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(move || handle_connection(stream, &state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }

    // Only reachable after the signal handler has shut the tracker down.
    lifecycle::shutdown(&shared_state);
    if let Err(err) = fs::remove_file(&socket_path) {
        warn!(error = %err, "Failed to remove daemon socket");
    }
    info!("Playtime daemon stopped");
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: &DaemonState) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handlers::handle_request(request, state);
    if let Err(err) = write_response(&mut stream, response) {
        tracing::debug!(error = %err, "Failed to write response");
    }
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn write_response(stream: &mut UnixStream, response: Response) -> Result<(), String> {
    let mut payload = serde_json::to_vec(&response)
        .map_err(|err| format!("Failed to serialize response: {}", err))?;
    payload.push(b'\n');
    stream
        .write_all(&payload)
        .map_err(|err| format!("Failed to write response: {}", err))?;
    stream
        .flush()
        .map_err(|err| format!("Failed to flush response: {}", err))
}
