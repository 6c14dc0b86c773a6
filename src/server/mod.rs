/// Server management module for Fleet Warden.
///
/// This module holds the identity and runtime state of each managed server,
/// the seam to the OS process table, and the monitor that keeps the runtime
/// state in line with reality.
/// All public components are instrumented with `tracing` spans.
///
/// # Components
///
/// * `lifecycle` - Server status state machine and its transition history
/// * `monitor` - Per-server polling loop (process liveness, RCON, players)
/// * `process` - Process lookup, launch and termination
///
/// # Examples
///
/// ```
/// use fleet_warden::config::ServerConfig;
/// use fleet_warden::server::{ManagedServer, ServerStatus};
///
/// let server = ManagedServer::new(ServerConfig::new("island", "/srv/ark/island"));
/// assert_eq!(server.state().status(), ServerStatus::Stopped);
/// assert_eq!(server.executable_name().as_deref(), Some("ArkAscendedServer.exe"));
/// ```
pub mod lifecycle;
pub mod monitor;
mod process;

pub use lifecycle::{MetricSample, ServerSnapshot, ServerState, ServerStatus, StatusEvent};
pub use monitor::{ServerMonitor, parse_player_list};
pub use process::{ProcessControl, ProcessInfo, ServerId, SystemProcesses};

use crate::config::ServerConfig;
use crate::rcon::RconEndpoint;
use std::path::{Path, PathBuf};

/// One configured server: immutable identity plus its runtime state.
pub struct ManagedServer {
    id: ServerId,
    config: ServerConfig,
    state: ServerState,
}

impl ManagedServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            id: ServerId::from(config.id),
            config,
            state: ServerState::new(),
        }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.config.active
    }

    pub fn install_dir(&self) -> &Path {
        &self.config.install_dir
    }

    pub fn executable_path(&self) -> PathBuf {
        self.config.install_dir.join(&self.config.executable)
    }

    pub fn executable_name(&self) -> Option<String> {
        self.config
            .executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }

    /// Whether the server executable is present on disk.
    pub fn is_installed(&self) -> bool {
        self.executable_path().is_file()
    }

    pub fn save_dir(&self) -> PathBuf {
        if self.config.save_dir.is_absolute() {
            self.config.save_dir.clone()
        } else {
            self.config.install_dir.join(&self.config.save_dir)
        }
    }

    /// The file whose modification time advances when the world is saved.
    pub fn world_file(&self) -> Option<PathBuf> {
        self.config
            .world_file
            .as_ref()
            .map(|file| self.save_dir().join(file))
    }

    pub fn rcon_endpoint(&self) -> RconEndpoint {
        RconEndpoint {
            host: self.config.ip.clone(),
            port: self.config.rcon_port,
            password: self.config.rcon_password.clone(),
        }
    }
}

impl std::fmt::Debug for ManagedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedServer")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("status", &self.state.status())
            .finish()
    }
}
