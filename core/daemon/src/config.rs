//! Daemon configuration.
//!
//! Read from `~/.playtime/config.toml` (or `--config`). A missing file means
//! defaults; every path defaults to a location under `~/.playtime/`.
//! Command-line flags override the file.

use serde::Deserialize;
use std::path::PathBuf;

use playtime_core::DEFAULT_MAX_IN_FLIGHT_MERGES;

pub const ROOT_DIR_NAME: &str = ".playtime";
pub const SOCKET_NAME: &str = "daemon.sock";
const CONFIG_FILE_NAME: &str = "config.toml";
const LEDGER_FILE_NAME: &str = "ledger.db";
const LOG_FILE_NAME: &str = "playtimed.log";
const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub daemon: SocketConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerConfig {
    /// Zero disables periodic snapshots; shutdown still flushes.
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_max_in_flight_merges")]
    pub max_in_flight_merges: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: default_snapshot_interval_secs(),
            max_in_flight_merges: default_max_in_flight_merges(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SocketConfig {
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log to stdout. When false, logs go to `file`.
    #[serde(default = "default_true")]
    pub stdout: bool,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            file: None,
        }
    }
}

/// Command-line overrides applied on top of the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub db: Option<PathBuf>,
    pub socket: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

fn default_snapshot_interval_secs() -> u64 {
    DEFAULT_SNAPSHOT_INTERVAL_SECS
}

fn default_max_in_flight_merges() -> usize {
    DEFAULT_MAX_IN_FLIGHT_MERGES
}

fn default_true() -> bool {
    true
}

impl DaemonConfig {
    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(db) = overrides.db {
            self.ledger.path = Some(db);
        }
        if let Some(socket) = overrides.socket {
            self.daemon.socket_path = Some(socket);
        }
        if let Some(log_file) = overrides.log_file {
            self.logging.stdout = false;
            self.logging.file = Some(log_file);
        }
    }

    pub fn ledger_path(&self) -> Result<PathBuf, String> {
        match &self.ledger.path {
            Some(path) => Ok(path.clone()),
            None => Ok(playtime_root()?.join("daemon").join(LEDGER_FILE_NAME)),
        }
    }

    pub fn socket_path(&self) -> Result<PathBuf, String> {
        match &self.daemon.socket_path {
            Some(path) => Ok(path.clone()),
            None => Ok(playtime_root()?.join(SOCKET_NAME)),
        }
    }

    pub fn log_file_path(&self) -> Result<PathBuf, String> {
        match &self.logging.file {
            Some(path) => Ok(path.clone()),
            None => Ok(playtime_root()?.join("logs").join(LOG_FILE_NAME)),
        }
    }

    pub fn tracker_config(&self) -> playtime_core::TrackerConfig {
        playtime_core::TrackerConfig {
            max_in_flight_merges: self.tracker.max_in_flight_merges,
        }
    }
}

pub fn playtime_root() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(ROOT_DIR_NAME))
}

pub fn default_config_path() -> Result<PathBuf, String> {
    Ok(playtime_root()?.join(CONFIG_FILE_NAME))
}

pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read config {}: {}",
            config_path.display(),
            err
        )
    })?;
    toml::from_str::<DaemonConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse config {}: {}",
            config_path.display(),
            err
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("missing.toml");
        let config = load_config(Some(path)).expect("load config");

        assert_eq!(
            config.tracker.snapshot_interval_secs,
            DEFAULT_SNAPSHOT_INTERVAL_SECS
        );
        assert_eq!(
            config.tracker.max_in_flight_merges,
            DEFAULT_MAX_IN_FLIGHT_MERGES
        );
        assert!(config.logging.stdout);
        assert!(config.ledger.path.is_none());
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            r#"
[ledger]
path = "/var/lib/playtime/ledger.db"

[tracker]
snapshot_interval_secs = 60
max_in_flight_merges = 2

[daemon]
socket_path = "/run/playtime.sock"

[logging]
stdout = false
file = "/var/log/playtimed.log"
            "#,
        )
        .expect("write config");

        let config = load_config(Some(path)).expect("load config");
        assert_eq!(
            config.ledger_path().expect("ledger path"),
            PathBuf::from("/var/lib/playtime/ledger.db")
        );
        assert_eq!(config.tracker.snapshot_interval_secs, 60);
        assert_eq!(config.tracker_config().max_in_flight_merges, 2);
        assert_eq!(
            config.socket_path().expect("socket path"),
            PathBuf::from("/run/playtime.sock")
        );
        assert!(!config.logging.stdout);
        assert_eq!(
            config.log_file_path().expect("log path"),
            PathBuf::from("/var/log/playtimed.log")
        );
    }

    #[test]
    fn load_config_keeps_defaults_for_partial_sections() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "[tracker]\nsnapshot_interval_secs = 0\n").expect("write config");

        let config = load_config(Some(path)).expect("load config");
        assert_eq!(config.tracker.snapshot_interval_secs, 0);
        assert_eq!(
            config.tracker.max_in_flight_merges,
            DEFAULT_MAX_IN_FLIGHT_MERGES
        );
        assert!(config.logging.stdout);
    }

    #[test]
    fn load_config_rejects_unknown_keys() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "[tracker]\nsnapshot_every = 5\n").expect("write config");

        let err = load_config(Some(path)).unwrap_err();
        assert!(err.contains("Failed to parse config"), "{err}");
    }

    #[test]
    fn overrides_take_precedence() {
        let mut config = DaemonConfig::default();
        config.apply_overrides(Overrides {
            db: Some(PathBuf::from("/tmp/ledger.db")),
            socket: Some(PathBuf::from("/tmp/playtime.sock")),
            log_file: Some(PathBuf::from("/tmp/playtimed.log")),
        });

        assert_eq!(
            config.ledger_path().expect("ledger path"),
            PathBuf::from("/tmp/ledger.db")
        );
        assert_eq!(
            config.socket_path().expect("socket path"),
            PathBuf::from("/tmp/playtime.sock")
        );
        assert!(!config.logging.stdout);
        assert_eq!(
            config.log_file_path().expect("log path"),
            PathBuf::from("/tmp/playtimed.log")
        );
    }
}
