// Shared fakes for the integration tests. Each test crate uses a different
// subset, so unused items are expected.
#![allow(dead_code)]

use async_trait::async_trait;
use fleet_warden::config::{FleetConfig, ServerConfig};
use fleet_warden::error::{Error, Result};
use fleet_warden::notify::{Attachment, Notifier};
use fleet_warden::rcon::{RconConnector, RconEndpoint};
use fleet_warden::scheduler::ManualClock;
use fleet_warden::server::{ManagedServer, ProcessControl, ProcessInfo};
use fleet_warden::update::{BuildFeed, UpdateTool};
use fleet_warden::watchdog::CsvGraphRenderer;
use fleet_warden::{ConfigHandle, FleetManager, Services};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const APP_ID: &str = "2430930";

/// Creates an installed server under `root`: executable, save directory and app manifest.
pub fn installed_server(root: &Path, name: &str, rcon_port: u16, build: &str) -> ServerConfig {
    let install_dir = root.join(name);
    let mut config = ServerConfig::new(name, &install_dir);
    config.rcon_port = rcon_port;
    config.rcon_password = "secret".to_string();
    config.world_file = Some("TheIsland_WP.ark".to_string());

    let executable = install_dir.join(&config.executable);
    std::fs::create_dir_all(executable.parent().unwrap()).unwrap();
    std::fs::write(&executable, b"binary").unwrap();

    let save_dir = install_dir.join(&config.save_dir);
    std::fs::create_dir_all(&save_dir).unwrap();
    std::fs::write(save_dir.join("TheIsland_WP.ark"), b"world").unwrap();

    write_manifest(&install_dir, build);
    config
}

pub fn write_manifest(install_dir: &Path, build: &str) {
    let steamapps = install_dir.join("steamapps");
    std::fs::create_dir_all(&steamapps).unwrap();
    std::fs::write(
        steamapps.join(format!("appmanifest_{}.acf", APP_ID)),
        format!(
            "\"AppState\"\n{{\n\t\"appid\"\t\t\"{}\"\n\t\"buildid\"\t\t\"{}\"\n}}\n",
            APP_ID, build
        ),
    )
    .unwrap();
}

/// In-memory process table keyed by server name.
#[derive(Default)]
pub struct FakeProcesses {
    running: Mutex<HashMap<String, u32>>,
    next_pid: AtomicU32,
    launches: Mutex<Vec<String>>,
    kills: Mutex<Vec<String>>,
    unkillable: Mutex<HashSet<String>>,
    fail_launch: AtomicBool,
}

impl FakeProcesses {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        })
    }

    pub fn start(&self, name: &str) -> u32 {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.running.lock().unwrap().insert(name.to_string(), pid);
        pid
    }

    pub fn exit(&self, name: &str) {
        self.running.lock().unwrap().remove(name);
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running.lock().unwrap().contains_key(name)
    }

    pub fn launches(&self) -> Vec<String> {
        self.launches.lock().unwrap().clone()
    }

    pub fn kills(&self) -> Vec<String> {
        self.kills.lock().unwrap().clone()
    }

    /// Makes `kill` fail for this server, leaving its process running.
    pub fn make_unkillable(&self, name: &str) {
        self.unkillable.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_launches(&self) {
        self.fail_launch.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProcessControl for FakeProcesses {
    async fn find(&self, server: &ManagedServer) -> Result<Option<ProcessInfo>> {
        Ok(self
            .running
            .lock()
            .unwrap()
            .get(server.name())
            .map(|&pid| ProcessInfo {
                pid,
                cpu_percent: 12.5,
                memory_bytes: 8 * 1024 * 1024 * 1024,
            }))
    }

    async fn kill(&self, pid: u32) -> Result<()> {
        let mut running = self.running.lock().unwrap();
        let name = running
            .iter()
            .find(|(_, p)| **p == pid)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| Error::Process(format!("no process {}", pid)))?;
        if self.unkillable.lock().unwrap().contains(&name) {
            return Err(Error::Process(format!("kill {}: operation not permitted", pid)));
        }
        running.remove(&name);
        self.kills.lock().unwrap().push(name);
        Ok(())
    }

    async fn launch(&self, server: &ManagedServer) -> Result<u32> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(Error::Process("launch refused".to_string()));
        }
        self.launches.lock().unwrap().push(server.name().to_string());
        Ok(self.start(server.name()))
    }
}

/// RCON fake wired to a [`FakeProcesses`]: a server answers only while its
/// process runs, and `DoExit` ends the process.
pub struct FakeRcon {
    processes: Arc<FakeProcesses>,
    servers: Mutex<HashMap<u16, String>>,
    rosters: Mutex<HashMap<u16, Vec<String>>>,
    unreachable: Mutex<HashSet<u16>>,
    ignores_exit: Mutex<HashSet<u16>>,
    world_files: Mutex<HashMap<u16, PathBuf>>,
    commands: Mutex<Vec<(u16, String)>>,
}

impl FakeRcon {
    pub fn new(processes: Arc<FakeProcesses>) -> Arc<Self> {
        Arc::new(Self {
            processes,
            servers: Mutex::default(),
            rosters: Mutex::default(),
            unreachable: Mutex::default(),
            ignores_exit: Mutex::default(),
            world_files: Mutex::default(),
            commands: Mutex::default(),
        })
    }

    /// Makes the fake answer for this server's RCON port.
    pub fn attach(&self, server: &ManagedServer) {
        let port = server.config().rcon_port;
        self.servers
            .lock()
            .unwrap()
            .insert(port, server.name().to_string());
        if let Some(world) = server.world_file() {
            self.world_files.lock().unwrap().insert(port, world);
        }
    }

    pub fn set_roster(&self, port: u16, players: &[&str]) {
        self.rosters
            .lock()
            .unwrap()
            .insert(port, players.iter().map(|p| p.to_string()).collect());
    }

    pub fn set_unreachable(&self, port: u16, unreachable: bool) {
        let mut set = self.unreachable.lock().unwrap();
        if unreachable {
            set.insert(port);
        } else {
            set.remove(&port);
        }
    }

    pub fn ignore_exit(&self, port: u16) {
        self.ignores_exit.lock().unwrap().insert(port);
    }

    /// Every command sent to `port`, in order.
    pub fn commands(&self, port: u16) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| *p == port)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Chat broadcasts sent to `port`, without the `ServerChat ` prefix.
    pub fn chats(&self, port: u16) -> Vec<String> {
        self.commands(port)
            .into_iter()
            .filter_map(|c| c.strip_prefix("ServerChat ").map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl RconConnector for FakeRcon {
    async fn execute(&self, endpoint: &RconEndpoint, command: &str) -> Result<String> {
        let port = endpoint.port;
        self.commands
            .lock()
            .unwrap()
            .push((port, command.to_string()));

        let name = self.servers.lock().unwrap().get(&port).cloned();
        let Some(name) = name else {
            return Err(Error::RconUnreachable(format!("nothing on port {}", port)));
        };
        if !self.processes.is_running(&name) || self.unreachable.lock().unwrap().contains(&port) {
            return Err(Error::RconUnreachable(format!("{} refused", port)));
        }

        match command {
            "listplayers" => {
                let roster = self
                    .rosters
                    .lock()
                    .unwrap()
                    .get(&port)
                    .cloned()
                    .unwrap_or_default();
                if roster.is_empty() {
                    Ok("No Players Connected".to_string())
                } else {
                    Ok(roster
                        .iter()
                        .enumerate()
                        .map(|(i, p)| format!("{}. {}, 000{}", i, p, i))
                        .collect::<Vec<_>>()
                        .join("\n"))
                }
            }
            "DoExit" => {
                if !self.ignores_exit.lock().unwrap().contains(&port) {
                    self.processes.exit(&name);
                }
                Ok("Exiting...".to_string())
            }
            "SaveWorld" => {
                let world = self.world_files.lock().unwrap().get(&port).cloned();
                if let Some(world) = world {
                    std::fs::write(world, b"saved world").map_err(Error::from)?;
                }
                Ok("World Saved".to_string())
            }
            _ => Ok(String::new()),
        }
    }
}

/// Update tool fake that records overlapping invocations.
pub struct RecordingTool {
    delay: Duration,
    installs_build: Option<String>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: Mutex<Vec<PathBuf>>,
    failing: Mutex<HashSet<PathBuf>>,
}

struct ActiveCall<'a>(&'a AtomicUsize);

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RecordingTool {
    pub fn new(delay: Duration, installs_build: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            delay,
            installs_build: installs_build.map(str::to_string),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            calls: Mutex::default(),
            failing: Mutex::default(),
        })
    }

    pub fn fail_for(&self, install_dir: &Path) {
        self.failing
            .lock()
            .unwrap()
            .insert(install_dir.to_path_buf());
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpdateTool for RecordingTool {
    async fn install(&self, install_dir: &Path, _app_id: &str) -> Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveCall(&self.active);
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push(install_dir.to_path_buf());

        tokio::time::sleep(self.delay).await;

        if self.failing.lock().unwrap().contains(install_dir) {
            return Err(Error::UpdateTool("exit status 8".to_string()));
        }
        if let Some(build) = &self.installs_build {
            write_manifest(install_dir, build);
        }
        Ok(())
    }
}

/// Build feed with a fixed answer.
pub struct FakeFeed(pub Option<String>);

#[async_trait]
impl BuildFeed for FakeFeed {
    async fn latest_build(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Notifier that keeps every message it was given.
#[derive(Default)]
pub struct RecordingNotifier {
    posts: Mutex<Vec<String>>,
    next_id: AtomicU32,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn posts(&self) -> Vec<String> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn post(&self, content: &str) -> Result<String> {
        self.posts.lock().unwrap().push(content.to_string());
        Ok((self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string())
    }

    async fn edit(&self, _message_id: &str, _content: &str) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _message_id: &str) -> Result<()> {
        Ok(())
    }

    async fn post_attachment(&self, content: &str, _attachment: Attachment) -> Result<String> {
        self.post(content).await
    }
}

/// A fleet over fakes, plus handles to the fakes.
pub struct Harness {
    pub fleet: FleetManager,
    pub processes: Arc<FakeProcesses>,
    pub rcon: Arc<FakeRcon>,
    pub tool: Arc<RecordingTool>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(config: FleetConfig, tool: Arc<RecordingTool>, latest_build: Option<&str>) -> Self {
        let processes = FakeProcesses::new();
        let rcon = FakeRcon::new(processes.clone());
        let notifier = RecordingNotifier::new();
        let clock = Arc::new(ManualClock::new(
            chrono::NaiveDate::from_ymd_opt(2026, 10, 19)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
        ));

        let services = Services {
            processes: processes.clone(),
            rcon: rcon.clone(),
            tool: tool.clone(),
            feed: Arc::new(FakeFeed(latest_build.map(str::to_string))),
            notifier: notifier.clone(),
            renderer: Arc::new(CsvGraphRenderer),
            clock: clock.clone(),
        };
        let fleet = FleetManager::new(ConfigHandle::in_memory(config), services);
        for server in fleet.servers() {
            rcon.attach(server);
        }

        Self {
            fleet,
            processes,
            rcon,
            tool,
            notifier,
            clock,
        }
    }

    pub fn server(&self, name: &str) -> Arc<ManagedServer> {
        self.fleet.server(name).unwrap()
    }

    /// Starts the process and lets the monitor observe it.
    pub async fn bring_up(&self, name: &str, reachable: bool) {
        let server = self.server(name);
        self.processes.start(name);
        self.rcon
            .set_unreachable(server.config().rcon_port, !reachable);
        self.fleet.monitor().refresh(&server).await;
    }
}

/// Asserts that `expected` appears in `trail` in order, possibly with gaps.
pub fn assert_subsequence<T: PartialEq + std::fmt::Debug>(trail: &[T], expected: &[T]) {
    let mut remaining = expected.iter().peekable();
    for item in trail {
        if remaining.peek() == Some(&item) {
            remaining.next();
        }
    }
    assert!(
        remaining.peek().is_none(),
        "expected {:?} in order within {:?}",
        expected,
        trail
    );
}
