//! playtime-ctl: command-line client for the playtime daemon.
//!
//! Delivers activity signals (start, end, presence) and reads back totals,
//! live sessions, and daemon health. Responses are printed as JSON exactly
//! as the daemon returns them.

mod daemon_client;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use playtime_daemon_protocol::Method;

#[derive(Parser)]
#[command(name = "playtime-ctl")]
#[command(about = "Talk to the playtime daemon")]
#[command(version)]
struct Cli {
    /// Daemon socket (default: $PLAYTIME_DAEMON_SOCKET or ~/.playtime/daemon.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start counting time for an identity
    Start {
        identity: String,
        activity: String,
    },

    /// Stop counting time for an identity
    End { identity: String },

    /// Report presence; omit the activity to mean "doing nothing"
    Presence {
        identity: String,
        activity: Option<String>,
    },

    /// Show accumulated totals (nanoseconds per activity) for an identity
    Totals { identity: String },

    /// List live sessions
    Sessions,

    /// Flush live sessions into the ledger now
    Snapshot,

    /// Show daemon health
    Health,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        tracing::error!(error = %err, "playtime-ctl failed");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<(), String> {
    let socket = daemon_client::socket_path(cli.socket)?;
    tracing::debug!(socket = %socket.display(), "Using daemon socket");

    let (method, params) = match cli.command {
        Commands::Start { identity, activity } => (
            Method::ActivityStarted,
            Some(json!({ "identity": identity, "activity": activity })),
        ),
        Commands::End { identity } => {
            (Method::ActivityEnded, Some(json!({ "identity": identity })))
        }
        Commands::Presence { identity, activity } => (
            Method::Presence,
            Some(json!({ "identity": identity, "activity": activity })),
        ),
        Commands::Totals { identity } => {
            (Method::GetTotals, Some(json!({ "identity": identity })))
        }
        Commands::Sessions => (Method::GetLiveSessions, None),
        Commands::Snapshot => (Method::Snapshot, None),
        Commands::Health => (Method::GetHealth, None),
    };

    let data = daemon_client::call(&socket, method, params)?;
    print_json(&data)
}

fn print_json(value: &Value) -> Result<(), String> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| format!("Failed to render response: {}", err))?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_presence_without_activity() {
        let cli = Cli::try_parse_from(["playtime-ctl", "presence", "user-1"]).expect("parse");
        match cli.command {
            Commands::Presence { identity, activity } => {
                assert_eq!(identity, "user-1");
                assert!(activity.is_none());
            }
            _ => panic!("expected presence"),
        }
    }

    #[test]
    fn socket_flag_is_global() {
        let cli = Cli::try_parse_from([
            "playtime-ctl",
            "start",
            "user-1",
            "chess",
            "--socket",
            "/tmp/playtime.sock",
        ])
        .expect("parse");
        assert_eq!(cli.socket, Some(PathBuf::from("/tmp/playtime.sock")));
        assert!(matches!(cli.command, Commands::Start { .. }));
    }

    #[test]
    fn start_requires_activity() {
        assert!(Cli::try_parse_from(["playtime-ctl", "start", "user-1"]).is_err());
    }
}
