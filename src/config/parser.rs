use crate::error::{Error, Result};
use crate::scheduler::ScheduledTask;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Configuration for a single managed server.
///
/// One entry describes one dedicated server install and the OS process that
/// runs from it.
///
/// # Examples
///
/// ```
/// use fleet_warden::config::ServerConfig;
///
/// let server = ServerConfig::new("island", "/srv/ark/island");
/// assert!(server.active);
/// assert_eq!(server.rcon_port, 27020);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Stable identifier, generated on first load when missing.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    /// Display name, unique across the fleet.
    pub name: String,

    /// Cluster the server shares mods and transfers with.
    #[serde(default)]
    pub cluster: Option<String>,

    /// Root of the server install.
    pub install_dir: PathBuf,

    /// Executable path relative to `install_dir`.
    #[serde(default = "default_executable")]
    pub executable: PathBuf,

    /// Command-line arguments passed on launch.
    #[serde(default)]
    pub launch_args: Vec<String>,

    /// Address RCON connects to.
    #[serde(default = "default_ip")]
    pub ip: String,

    #[serde(default = "default_game_port")]
    pub game_port: u16,

    #[serde(default = "default_query_port")]
    pub query_port: u16,

    #[serde(default = "default_rcon_port")]
    pub rcon_port: u16,

    #[serde(default)]
    pub rcon_password: String,

    /// Whether the server takes part in fleet operations.
    #[serde(default = "default_true")]
    pub active: bool,

    /// Directory holding the world save, relative to `install_dir` unless absolute.
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,

    /// World save file inside `save_dir` whose timestamp confirms a save.
    #[serde(default)]
    pub world_file: Option<String>,
}

impl ServerConfig {
    /// Creates a server entry with default ports and paths.
    pub fn new(name: impl Into<String>, install_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            cluster: None,
            install_dir: install_dir.into(),
            executable: default_executable(),
            launch_args: Vec::new(),
            ip: default_ip(),
            game_port: default_game_port(),
            query_port: default_query_port(),
            rcon_port: default_rcon_port(),
            rcon_password: String::new(),
            active: true,
            save_dir: default_save_dir(),
            world_file: None,
        }
    }
}

fn default_executable() -> PathBuf {
    PathBuf::from("ShooterGame/Binaries/Win64/ArkAscendedServer.exe")
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_game_port() -> u16 {
    7777
}

fn default_query_port() -> u16 {
    27015
}

fn default_rcon_port() -> u16 {
    27020
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("ShooterGame/Saved")
}

fn default_true() -> bool {
    true
}

/// Monitor polling settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorSettings {
    pub poll_interval_secs: u64,
    pub rcon_timeout_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            rcon_timeout_secs: 5,
        }
    }
}

impl MonitorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn rcon_timeout(&self) -> Duration {
        Duration::from_secs(self.rcon_timeout_secs.max(1))
    }
}

/// Graceful shutdown settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShutdownSettings {
    /// Total countdown before a forced stop. `None` means 900 seconds.
    pub timeout_secs: Option<u64>,
    pub poll_interval_secs: u64,
    /// How long to wait for the process to exit after `DoExit`.
    pub exit_wait_secs: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            poll_interval_secs: 10,
            exit_wait_secs: 60,
        }
    }
}

impl ShutdownSettings {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(900);

    pub fn timeout(&self) -> Duration {
        match self.timeout_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn exit_wait(&self) -> Duration {
        Duration::from_secs(self.exit_wait_secs)
    }
}

/// Update tool and build feed settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpdateSettings {
    /// Path to the package-update tool executable.
    pub tool_path: PathBuf,
    pub app_id: String,
    pub tool_timeout_secs: u64,
    pub build_feed_url: Option<String>,
    /// JSON pointer to the build id inside the feed document.
    pub build_id_pointer: String,
    /// Minutes between update checks. `0` disables the periodic check.
    pub check_interval_mins: u64,
    /// Run the update pipeline when the periodic check finds updates.
    pub auto_update: bool,
    /// One-second checks that a process has exited before updating.
    pub exit_confirm_attempts: u32,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            tool_path: PathBuf::from("steamcmd"),
            app_id: "2430930".to_string(),
            tool_timeout_secs: 1800,
            build_feed_url: Some("https://api.steamcmd.net/v1/info/2430930".to_string()),
            build_id_pointer: "/data/2430930/depots/branches/public/buildid".to_string(),
            check_interval_mins: 30,
            auto_update: true,
            exit_confirm_attempts: 10,
        }
    }
}

impl UpdateSettings {
    pub const MIN_TOOL_TIMEOUT: Duration = Duration::from_secs(300);

    /// Tool timeout, never below five minutes.
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs).max(Self::MIN_TOOL_TIMEOUT)
    }

    pub fn check_interval(&self) -> Option<Duration> {
        (self.check_interval_mins > 0).then(|| Duration::from_secs(self.check_interval_mins * 60))
    }
}

/// Backup settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackupSettings {
    /// Directory holding one sub-directory of archives per server.
    pub root: PathBuf,
    /// Minutes between periodic backups. `0` disables periodic backups.
    pub interval_mins: u64,
    pub retention_days: u64,
    pub save_wait_secs: u64,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("backups"),
            interval_mins: 0,
            retention_days: 8,
            save_wait_secs: 60,
        }
    }
}

impl BackupSettings {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_mins > 0).then(|| Duration::from_secs(self.interval_mins * 60))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }

    pub fn save_wait(&self) -> Duration {
        Duration::from_secs(self.save_wait_secs)
    }
}

/// Calendar and periodic scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Delay before a periodic job retries when a major operation is running.
    pub retry_interval_mins: u64,
    /// How long a due calendar slot may wait for the operation lock.
    pub dispatch_grace_mins: u64,
    pub tasks: Vec<ScheduledTask>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            retry_interval_mins: 5,
            dispatch_grace_mins: 5,
            tasks: Vec::new(),
        }
    }
}

impl SchedulerSettings {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_mins.max(1) * 60)
    }

    pub fn dispatch_grace(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.dispatch_grace_mins as i64)
    }
}

/// Status reporting settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchdogSettings {
    /// Webhook of the notification channel. Notifications are only logged when unset.
    pub webhook_url: Option<String>,
    pub interval_secs: u64,
    /// Seconds between graph refreshes. `0` disables graphs.
    pub graph_interval_secs: u64,
    pub status_message_id: Option<String>,
    pub graph_message_id: Option<String>,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            webhook_url: None,
            interval_secs: 60,
            graph_interval_secs: 3600,
            status_message_id: None,
            graph_message_id: None,
        }
    }
}

impl WatchdogSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Number of status cycles between two graph refreshes.
    pub fn graph_every(&self) -> Option<u64> {
        if self.graph_interval_secs == 0 {
            return None;
        }
        Some((self.graph_interval_secs / self.interval_secs.max(1)).max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    /// Directory for daily rolling log files.
    pub directory: Option<PathBuf>,
}

/// Main configuration document.
///
/// # JSON Schema
///
/// ```json
/// {
///   "servers": [
///     {
///       "name": "island",
///       "install_dir": "/srv/ark/island",
///       "rcon_port": 27020,
///       "rcon_password": "secret"
///     }
///   ],
///   "update": { "auto_update": true },
///   "scheduler": {
///     "tasks": [
///       { "name": "nightly", "kind": "daily_reboot", "time": "04:00:00",
///         "days": [true, true, true, true, true, true, true] }
///     ]
///   }
/// }
/// ```
///
/// # Examples
///
/// ```no_run
/// use fleet_warden::config::FleetConfig;
///
/// let config = FleetConfig::from_file("fleet.json").unwrap();
/// println!("Loaded {} servers", config.servers.len());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FleetConfig {
    pub servers: Vec<ServerConfig>,
    pub monitor: MonitorSettings,
    pub shutdown: ShutdownSettings,
    pub update: UpdateSettings,
    pub backup: BackupSettings,
    pub scheduler: SchedulerSettings,
    pub watchdog: WatchdogSettings,
    pub logging: LoggingSettings,
}

impl FleetConfig {
    /// Loads a configuration from a file path.
    ///
    /// Files ending in `.yaml` or `.yml` are parsed as YAML, anything else as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The file cannot be read
    /// * The file contents do not parse
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read config file: {}", e)))?;

        if is_yaml(path) {
            Self::parse_from_yaml(&content)
        } else {
            Self::parse_from_str(&content)
        }
    }

    /// Parses a configuration from a JSON string.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON config: {}", e)))
    }

    /// Parses a configuration from a YAML string.
    pub fn parse_from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse YAML config: {}", e)))
    }

    /// Writes the configuration back, in the format implied by the extension.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml(path) {
            serde_yaml::to_string(self).map_err(|e| Error::Serialization(e.to_string()))?
        } else {
            serde_json::to_string_pretty(self)?
        };

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config_str = r#"{
            "servers": [
                { "name": "island", "install_dir": "/srv/island", "rcon_password": "pw" }
            ]
        }"#;

        let config = FleetConfig::parse_from_str(config_str).unwrap();

        assert_eq!(config.servers.len(), 1);
        let island = &config.servers[0];
        assert_eq!(island.name, "island");
        assert_eq!(island.rcon_port, 27020);
        assert!(island.active);
        assert_eq!(config.shutdown.timeout(), Duration::from_secs(900));
        assert_eq!(config.backup.retention_days, 8);
    }

    #[test]
    fn test_tool_timeout_has_a_floor() {
        let settings = UpdateSettings {
            tool_timeout_secs: 10,
            ..Default::default()
        };
        assert_eq!(settings.tool_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_zero_shutdown_timeout_falls_back_to_default() {
        let settings = ShutdownSettings {
            timeout_secs: Some(0),
            ..Default::default()
        };
        assert_eq!(settings.timeout(), ShutdownSettings::DEFAULT_TIMEOUT);
    }
}
