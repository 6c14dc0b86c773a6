// src/server/process.rs
use crate::error::{Error, Result};
use crate::server::ManagedServer;
use async_process::{Command, Stdio};
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, System};
use uuid::Uuid;

/// Unique identifier for a managed server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(Uuid);

impl ServerId {
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for ServerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live OS process matched to a server, with one resource sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// Access to the OS process table.
///
/// The monitor uses it to find a server's process, the pipelines to force-kill
/// and relaunch it.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Finds the process running the server's executable from its install directory.
    async fn find(&self, server: &ManagedServer) -> Result<Option<ProcessInfo>>;

    /// Terminates a process immediately.
    async fn kill(&self, pid: u32) -> Result<()>;

    /// Launches the server and returns the new pid.
    async fn launch(&self, server: &ManagedServer) -> Result<u32>;
}

/// [`ProcessControl`] backed by the real process table.
///
/// The `System` is kept between lookups so CPU usage is measured over the
/// interval since the previous refresh.
pub struct SystemProcesses {
    system: Arc<Mutex<System>>,
}

impl SystemProcesses {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }
}

impl Default for SystemProcesses {
    fn default() -> Self {
        Self::new()
    }
}

/// Process names are truncated by some platforms (15 bytes on Linux).
fn name_matches(process_name: &str, executable: &str) -> bool {
    let process_name = process_name.to_ascii_lowercase();
    let executable = executable.to_ascii_lowercase();
    if process_name == executable {
        return true;
    }
    process_name.len() >= 15 && executable.starts_with(&process_name)
}

fn under_install_dir(exe: Option<&Path>, install_dir: &Path) -> bool {
    let Some(exe) = exe else {
        return false;
    };
    let install_dir = install_dir
        .canonicalize()
        .unwrap_or_else(|_| install_dir.to_path_buf());
    exe.starts_with(&install_dir)
}

#[async_trait]
impl ProcessControl for SystemProcesses {
    #[tracing::instrument(skip(self, server), fields(server = %server.name()))]
    async fn find(&self, server: &ManagedServer) -> Result<Option<ProcessInfo>> {
        let Some(executable) = server.executable_name() else {
            return Ok(None);
        };
        let install_dir = server.install_dir().to_path_buf();
        let system = Arc::clone(&self.system);

        tokio::task::spawn_blocking(move || {
            let mut sys = system
                .lock()
                .map_err(|_| Error::Process("Failed to lock process table".to_string()))?;
            sys.refresh_processes();

            let found = sys.processes().values().find(|p| {
                name_matches(p.name(), &executable) && under_install_dir(p.exe(), &install_dir)
            });

            Ok(found.map(|p| ProcessInfo {
                pid: p.pid().as_u32(),
                cpu_percent: p.cpu_usage(),
                memory_bytes: p.memory(),
            }))
        })
        .await
        .map_err(|e| Error::Process(format!("Process lookup task failed: {}", e)))?
    }

    #[tracing::instrument(skip(self))]
    async fn kill(&self, pid: u32) -> Result<()> {
        let system = Arc::clone(&self.system);

        tokio::task::spawn_blocking(move || {
            let mut sys = system
                .lock()
                .map_err(|_| Error::Process("Failed to lock process table".to_string()))?;
            let pid = Pid::from_u32(pid);
            if !sys.refresh_process(pid) {
                // Already gone.
                return Ok(());
            }
            match sys.process(pid) {
                Some(process) if !process.kill() => Err(Error::Process(format!(
                    "Failed to kill process {}",
                    pid
                ))),
                _ => Ok(()),
            }
        })
        .await
        .map_err(|e| Error::Process(format!("Kill task failed: {}", e)))?
    }

    #[tracing::instrument(skip(self, server), fields(server = %server.name()))]
    async fn launch(&self, server: &ManagedServer) -> Result<u32> {
        let executable = server.executable_path();
        if !executable.is_file() {
            return Err(Error::Process(format!(
                "Executable not found: {}",
                executable.display()
            )));
        }

        let mut command = Command::new(&executable);
        command.args(&server.config().launch_args);
        if let Some(dir) = executable.parent() {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = command
            .spawn()
            .map_err(|e| Error::Process(format!("Failed to start process: {}", e)))?;

        let pid = child.id();
        tracing::info!(pid, "Server process launched");
        Ok(pid)
    }
}
