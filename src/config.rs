use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, TorqueSlackError};

pub const DEFAULT_TORQUE_HOME: &str = "/var/spool/torque";
const DEFAULT_MIN_POST_DELAY_SECS: u64 = 6;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Daemon configuration, loaded from a YAML file with every field optional.
/// CLI flags override file values; the `TORQUE_HOME` environment variable
/// fills in the log root when neither specifies one.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Root of the TORQUE spool (holds `server_logs/` and
    /// `server_priv/accounting/`).
    #[serde(default = "default_torque_home")]
    pub torque_home: PathBuf,

    /// Slack incoming-webhook URL. Required unless running with --dry-run.
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Slack channel override (e.g. "#cluster").
    #[serde(default)]
    pub channel: Option<String>,

    /// Bot username shown on posted messages.
    #[serde(default)]
    pub username: Option<String>,

    /// Only track jobs owned by these users. Absence means all users.
    #[serde(default)]
    pub users: Option<Vec<String>>,

    /// Only track jobs owned by these groups. Absence means all groups.
    #[serde(default)]
    pub groups: Option<Vec<String>>,

    /// Minimum delay between webhook posts, to avoid flooding the channel.
    #[serde(default = "default_min_post_delay_secs")]
    pub min_post_delay_secs: u64,

    /// How often the tailers poll for new log bytes.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Job records untouched for this long are evicted.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// When true, notices are emitted for replayed history too (disables
    /// the startup time filter).
    #[serde(default)]
    pub replay_history: bool,
}

fn default_torque_home() -> PathBuf {
    std::env::var_os("TORQUE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TORQUE_HOME))
}

fn default_min_post_delay_secs() -> u64 {
    DEFAULT_MIN_POST_DELAY_SECS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            torque_home: default_torque_home(),
            webhook_url: None,
            channel: None,
            username: None,
            users: None,
            groups: None,
            min_post_delay_secs: DEFAULT_MIN_POST_DELAY_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            retention_days: DEFAULT_RETENTION_DAYS,
            replay_history: false,
        }
    }
}

impl Config {
    /// Load and parse a YAML config file. Unreadable or invalid files are
    /// fatal at startup.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| {
            TorqueSlackError::ConfigRead {
                path: path.to_path_buf(),
                source,
            }
        })?;
        serde_yaml::from_str(&contents).map_err(|source| TorqueSlackError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Directory holding the accounting log files.
    pub fn accounting_dir(&self) -> PathBuf {
        self.torque_home.join("server_priv").join("accounting")
    }

    /// Directory holding the server log files.
    pub fn server_log_dir(&self) -> PathBuf {
        self.torque_home.join("server_logs")
    }
}
