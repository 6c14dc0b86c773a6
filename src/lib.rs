/*!
 # Fleet Warden

 A Rust library and daemon for keeping a fleet of dedicated game servers
 updated, backed up and restarted on schedule.

 ## Overview

 Fleet Warden provides functionality to:
 - Watch every server's process and RCON port and track its status
 - Warn players and shut servers down gracefully
 - Detect new builds, update servers one tool run at a time, and restart them
 - Run reboots, maintenance shutdowns and backups at configured local times
 - Back up world saves and prune old archives
 - Keep a status message and metric graphs up to date on a webhook channel

 ## Basic Usage

 ```no_run
 use fleet_warden::{FleetManager, Result};

 #[tokio::main]
 async fn main() -> Result<()> {
     let fleet = FleetManager::from_config_file("fleet.json")?;

     // Monitors, calendar, periodic timers and the watchdog
     fleet.start();

     // Manual operations fail with `OperationInProgress` while another runs
     let results = fleet.check_updates().await;
     for (name, result) in results {
         println!("{}: update available = {}", name, result.update_available);
     }

     tokio::signal::ctrl_c().await?;
     fleet.shutdown();
     Ok(())
 }
 ```

 ## Features

 - **Status Monitoring**: Process liveness, RCON reachability and player rosters
 - **Graceful Shutdown**: Minute-by-minute warnings, early exit on empty servers
 - **Updates**: Parallel shutdown, serialized update tool, restart of what was running
 - **Scheduling**: Weekly calendar tasks plus re-arming backup and update-check timers
 - **Backups**: Confirmed world saves, tar.gz archives, retention sweep
 - **Watchdog**: Edited-in-place status table and periodic graphs
*/

pub mod backup;
pub mod config;
pub mod error;
pub mod lock;
pub mod notify;
pub mod rcon;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod update;
pub mod watchdog;

pub use config::{ConfigHandle, FleetConfig};
pub use error::{Error, Result};
pub use lock::{OperationGuard, OperationLock};
pub use server::{ManagedServer, ServerId, ServerStatus};

use async_trait::async_trait;
use backup::{BackupOrchestrator, BackupReport};
use chrono::NaiveDateTime;
use notify::{DiscordWebhook, LogNotifier, Notifier, announce};
use rcon::{RconConnector, TcpRcon};
use scheduler::{
    CalendarDispatcher, Clock, PeriodicJob, RearmingTimer, ScheduledTask, SystemClock, TaskKind,
    TaskRunner,
};
use server::{ProcessControl, ServerMonitor, SystemProcesses};
use shutdown::{GracefulShutdown, ShutdownReason};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use update::{
    BuildFeed, HttpBuildFeed, ServerUpdate, SteamCmd, UnknownBuildFeed, UpdateCheckResult,
    UpdateChecker, UpdatePipeline, UpdateTool,
};
use uuid::Uuid;
use watchdog::{CsvGraphRenderer, GraphRenderer, WatchdogReporter};

/// External collaborators of a [`FleetManager`].
///
/// [`Services::from_config`] wires the production implementations; tests
/// replace individual fields with fakes.
#[derive(Clone)]
pub struct Services {
    pub processes: Arc<dyn ProcessControl>,
    pub rcon: Arc<dyn RconConnector>,
    pub tool: Arc<dyn UpdateTool>,
    pub feed: Arc<dyn BuildFeed>,
    pub notifier: Arc<dyn Notifier>,
    pub renderer: Arc<dyn GraphRenderer>,
    pub clock: Arc<dyn Clock>,
}

impl Services {
    pub fn from_config(config: &FleetConfig) -> Self {
        let feed: Arc<dyn BuildFeed> = match &config.update.build_feed_url {
            Some(url) => Arc::new(HttpBuildFeed::new(
                url.clone(),
                config.update.build_id_pointer.clone(),
            )),
            None => Arc::new(UnknownBuildFeed),
        };
        let notifier: Arc<dyn Notifier> = match &config.watchdog.webhook_url {
            Some(url) => Arc::new(DiscordWebhook::new(url.clone())),
            None => Arc::new(LogNotifier::new()),
        };

        Self {
            processes: Arc::new(SystemProcesses::new()),
            rcon: Arc::new(TcpRcon::new(config.monitor.rcon_timeout())),
            tool: Arc::new(SteamCmd::new(config.update.tool_path.clone())),
            feed,
            notifier,
            renderer: Arc::new(CsvGraphRenderer),
            clock: Arc::new(SystemClock),
        }
    }
}

/// Manages a fleet of dedicated servers
///
/// This struct is the main entry point: it owns the per-server state, the
/// operation lock and every pipeline, and runs the background loops.
/// Clones share the same fleet. All operations are instrumented with `tracing` spans.
#[derive(Clone)]
pub struct FleetManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConfigHandle,
    servers: Vec<Arc<ManagedServer>>,
    lock: OperationLock,
    notifier: Arc<dyn Notifier>,
    monitor: Arc<ServerMonitor>,
    shutdown: Arc<GracefulShutdown>,
    checker: Arc<UpdateChecker>,
    pipeline: UpdatePipeline,
    backups: BackupOrchestrator,
    dispatcher: Arc<CalendarDispatcher>,
    watchdog: Arc<WatchdogReporter>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FleetManager {
    /// Create a fleet manager from a configuration file path
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(path), fields(config_path = ?path.as_ref()))]
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = ConfigHandle::load(path)?;
        let services = Services::from_config(&config.read());
        Ok(Self::new(config, services))
    }

    /// Create a fleet manager over an already loaded configuration
    #[tracing::instrument(skip(config, services), fields(num_servers = config.read().servers.len()))]
    pub fn new(config: ConfigHandle, services: Services) -> Self {
        let snapshot = config.snapshot();
        let servers: Vec<Arc<ManagedServer>> = snapshot
            .servers
            .iter()
            .cloned()
            .map(|c| Arc::new(ManagedServer::new(c)))
            .collect();
        let lock = OperationLock::new();

        let monitor = Arc::new(ServerMonitor::new(
            Arc::clone(&services.processes),
            Arc::clone(&services.rcon),
            snapshot.monitor.clone(),
        ));
        let shutdown = Arc::new(GracefulShutdown::new(
            Arc::clone(&monitor),
            Arc::clone(&services.notifier),
            snapshot.shutdown.clone(),
        ));
        let checker = Arc::new(UpdateChecker::new(
            Arc::clone(&services.feed),
            snapshot.update.app_id.clone(),
        ));
        let pipeline = UpdatePipeline::new(
            Arc::clone(&shutdown),
            Arc::clone(&services.processes),
            Arc::clone(&services.tool),
            Arc::clone(&checker),
            Arc::clone(&services.notifier),
            snapshot.update.clone(),
        );
        let backups = BackupOrchestrator::new(Arc::clone(&services.rcon), snapshot.backup.clone());
        let dispatcher = Arc::new(CalendarDispatcher::new(
            config.clone(),
            lock.clone(),
            Arc::clone(&services.clock),
        ));
        let watchdog = Arc::new(WatchdogReporter::new(
            Arc::clone(&services.notifier),
            config.clone(),
            lock.clone(),
            servers.clone(),
            Arc::clone(&services.renderer),
        ));

        tracing::info!("Created FleetManager");
        Self {
            inner: Arc::new(Inner {
                config,
                servers,
                lock,
                notifier: services.notifier,
                monitor,
                shutdown,
                checker,
                pipeline,
                backups,
                dispatcher,
                watchdog,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.inner.config
    }

    pub fn lock(&self) -> &OperationLock {
        &self.inner.lock
    }

    pub fn monitor(&self) -> &Arc<ServerMonitor> {
        &self.inner.monitor
    }

    pub fn dispatcher(&self) -> &Arc<CalendarDispatcher> {
        &self.inner.dispatcher
    }

    pub fn watchdog(&self) -> &Arc<WatchdogReporter> {
        &self.inner.watchdog
    }

    /// All configured servers, active or not.
    pub fn servers(&self) -> &[Arc<ManagedServer>] {
        &self.inner.servers
    }

    /// Look up a server by name
    pub fn server(&self, name: &str) -> Result<Arc<ManagedServer>> {
        self.inner.server(name)
    }

    /// Current status of every server, by name
    pub fn statuses(&self) -> Vec<(String, ServerStatus)> {
        self.inner
            .servers
            .iter()
            .map(|s| (s.name().to_string(), s.state().status()))
            .collect()
    }

    /// Start the background loops
    ///
    /// One monitor per active server, the calendar dispatcher, the backup and
    /// update-check timers, and the watchdog. Calling it twice restarts them.
    #[tracing::instrument(skip(self))]
    pub fn start(&self) {
        let inner = &self.inner;
        self.shutdown();

        let mut handles = inner.monitor.spawn_all(&inner.active_servers());
        handles.push(
            Arc::clone(&inner.dispatcher).spawn(Arc::clone(inner) as Arc<dyn TaskRunner>),
        );

        let backup: Arc<dyn PeriodicJob> = Arc::new(BackupJob(Arc::clone(inner)));
        let update_check: Arc<dyn PeriodicJob> = Arc::new(UpdateCheckJob(Arc::clone(inner)));
        for job in [backup, update_check] {
            handles.push(RearmingTimer::new(job, inner.lock.clone()).spawn());
        }

        handles.push(Arc::clone(&inner.watchdog).spawn());

        tracing::info!(tasks = handles.len(), "Fleet background tasks started");
        *inner.tasks.lock().unwrap_or_else(|p| p.into_inner()) = handles;
    }

    /// Stop the background loops. Servers keep running.
    pub fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        if !handles.is_empty() {
            tracing::info!(tasks = handles.len(), "Stopping fleet background tasks");
        }
        for handle in handles {
            handle.abort();
        }
    }

    /// Launch a server that is not running
    ///
    /// Also the way out of `Error`: a relaunched server is monitored again.
    #[tracing::instrument(skip(self), fields(server_name = %name))]
    pub async fn start_server(&self, name: &str) -> Result<u32> {
        let server = self.server(name)?;
        let processes = self.inner.monitor.processes();

        if let Some(process) = processes.find(&server).await? {
            tracing::debug!(pid = process.pid, "Server already running");
            return Err(Error::Process(format!(
                "{} is already running as pid {}",
                name, process.pid
            )));
        }

        let pid = processes.launch(&server).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to launch server");
            e
        })?;
        server
            .state()
            .set_status(ServerStatus::Starting, Some("manual start".to_string()))?;
        tracing::info!(pid, "Server launched");
        Ok(pid)
    }

    /// Stop a server right away, without a countdown
    #[tracing::instrument(skip(self), fields(server_name = %name))]
    pub async fn stop_server(&self, name: &str) -> Result<()> {
        let server = self.server(name)?;
        self.inner.shutdown.stop_now(&server).await;
        Ok(())
    }

    /// Check every active server against the build feed
    pub async fn check_updates(&self) -> Vec<(String, UpdateCheckResult)> {
        let servers = self.inner.active_servers();
        let results = self.inner.checker.check_all(&servers).await;
        servers
            .iter()
            .map(|s| s.name().to_string())
            .zip(results)
            .collect()
    }

    /// Check for updates and update every server that has one
    ///
    /// # Errors
    ///
    /// [`Error::OperationInProgress`] when another major operation is running.
    #[tracing::instrument(skip(self))]
    pub async fn update_now(&self) -> Result<Vec<ServerUpdate>> {
        let guard = self.inner.acquire("update")?;
        Ok(self.inner.run_update(&guard).await)
    }

    /// Back up every active server now
    #[tracing::instrument(skip(self))]
    pub async fn backup_now(&self) -> Result<BackupReport> {
        let guard = self.inner.acquire("backup")?;
        Ok(self.inner.run_backup(&guard).await)
    }

    /// Gracefully restart every running server
    ///
    /// Returns the names of the servers that were shut down and relaunched.
    #[tracing::instrument(skip(self))]
    pub async fn reboot(&self) -> Result<Vec<String>> {
        let guard = self.inner.acquire("reboot")?;
        Ok(self
            .inner
            .run_shutdown(&guard, ShutdownReason::DailyRestart, true)
            .await)
    }

    /// Gracefully stop every running server and leave it stopped
    #[tracing::instrument(skip(self))]
    pub async fn maintenance(&self) -> Result<Vec<String>> {
        let guard = self.inner.acquire("maintenance")?;
        Ok(self
            .inner
            .run_shutdown(&guard, ShutdownReason::Maintenance, false)
            .await)
    }

    /// Add a scheduled task
    ///
    /// # Errors
    ///
    /// [`Error::ConfigInvalid`] when a task with the same id exists.
    pub fn add_task(&self, task: ScheduledTask) -> Result<Uuid> {
        let id = task.id;
        self.inner.config.update(|c| {
            if c.scheduler.tasks.iter().any(|t| t.id == id) {
                return Err(Error::ConfigInvalid(format!(
                    "Scheduled task id {} is used twice",
                    id
                )));
            }
            c.scheduler.tasks.push(task);
            Ok::<(), Error>(())
        })?;
        tracing::info!(task = %id, "Scheduled task added");
        Ok(id)
    }

    /// Replace the scheduled task with the same id
    pub fn update_task(&self, task: ScheduledTask) -> Result<()> {
        let id = task.id;
        self.inner.config.update(|c| {
            let slot = c
                .scheduler
                .tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
            *slot = task;
            Ok::<(), Error>(())
        })?;
        tracing::info!(task = %id, "Scheduled task updated");
        Ok(())
    }

    /// Remove a scheduled task and return it
    pub fn remove_task(&self, id: Uuid) -> Result<ScheduledTask> {
        let removed = self.inner.config.update(|c| {
            let index = c
                .scheduler
                .tasks
                .iter()
                .position(|t| t.id == id)
                .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
            Ok::<_, Error>(c.scheduler.tasks.remove(index))
        })?;
        tracing::info!(task = %id, "Scheduled task removed");
        Ok(removed)
    }

    pub fn tasks(&self) -> Vec<ScheduledTask> {
        self.inner.config.read().scheduler.tasks.clone()
    }

    /// Soonest upcoming task and when it fires
    pub fn next_scheduled(&self) -> Option<(ScheduledTask, NaiveDateTime)> {
        self.inner.dispatcher.next_scheduled()
    }
}

impl Inner {
    fn server(&self, name: &str) -> Result<Arc<ManagedServer>> {
        self.servers
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))
    }

    /// Servers taking part in fleet operations.
    fn active_servers(&self) -> Vec<Arc<ManagedServer>> {
        self.servers
            .iter()
            .filter(|s| s.is_active() && s.is_installed())
            .cloned()
            .collect()
    }

    fn acquire(&self, operation: &str) -> Result<OperationGuard> {
        self.lock.try_acquire(operation).ok_or_else(|| {
            let holder = self.lock.holder().unwrap_or_else(|| "unknown".to_string());
            tracing::info!(operation, %holder, "Operation refused, lock held");
            Error::OperationInProgress(holder)
        })
    }

    async fn run_update(&self, guard: &OperationGuard) -> Vec<ServerUpdate> {
        let servers = self.active_servers();
        self.checker.check_all(&servers).await;
        let outdated: Vec<Arc<ManagedServer>> = servers
            .into_iter()
            .filter(|s| s.state().update_available())
            .collect();
        if outdated.is_empty() {
            tracing::info!("All servers up to date");
            return Vec::new();
        }
        self.pipeline.run(guard, &outdated).await
    }

    async fn run_backup(&self, guard: &OperationGuard) -> BackupReport {
        let report = self.backups.run(guard, &self.active_servers()).await;
        tracing::info!(
            archives = report.archives.len(),
            failures = report.failures.len(),
            pruned = report.pruned,
            "Backup run finished"
        );
        report
    }

    /// Shuts down the running servers; relaunches exactly those when `restart`.
    async fn run_shutdown(
        &self,
        _guard: &OperationGuard,
        reason: ShutdownReason,
        restart: bool,
    ) -> Vec<String> {
        let running: Vec<Arc<ManagedServer>> = self
            .active_servers()
            .into_iter()
            .filter(|s| s.state().status() == ServerStatus::Running)
            .collect();
        if running.is_empty() {
            tracing::info!(%reason, "No running servers to shut down");
            return Vec::new();
        }

        self.shutdown.run(&running, reason).await;

        if restart {
            for server in &running {
                match self.monitor.processes().launch(server).await {
                    Ok(pid) => {
                        tracing::info!(server = %server.name(), pid, "Server relaunched");
                        server
                            .state()
                            .transition(ServerStatus::Starting, Some(reason.to_string()));
                    }
                    Err(e) => {
                        tracing::error!(server = %server.name(), error = %e, "Relaunch failed");
                        server
                            .state()
                            .transition(ServerStatus::Error, Some(format!("relaunch failed: {}", e)));
                        announce(
                            self.notifier.as_ref(),
                            &format!("{} failed to start after {}: {}", server.name(), reason, e),
                        )
                        .await;
                    }
                }
            }
        }

        running.iter().map(|s| s.name().to_string()).collect()
    }
}

#[async_trait]
impl TaskRunner for Inner {
    async fn run_task(&self, task: ScheduledTask, guard: OperationGuard) {
        tracing::info!(task = %task.name, kind = %task.kind, "Running scheduled task");
        match task.kind {
            TaskKind::DailyReboot => {
                self.run_shutdown(&guard, ShutdownReason::DailyRestart, true)
                    .await;
            }
            TaskKind::MaintenanceShutdown => {
                self.run_shutdown(&guard, ShutdownReason::Maintenance, false)
                    .await;
            }
            TaskKind::ScheduledBackup => {
                self.run_backup(&guard).await;
            }
        }
    }
}

struct BackupJob(Arc<Inner>);

#[async_trait]
impl PeriodicJob for BackupJob {
    fn name(&self) -> &'static str {
        "periodic backup"
    }

    fn interval(&self) -> Option<Duration> {
        self.0.config.read().backup.interval()
    }

    fn retry_interval(&self) -> Duration {
        self.0.config.read().scheduler.retry_interval()
    }

    async fn run(&self, guard: OperationGuard) {
        self.0.run_backup(&guard).await;
    }
}

struct UpdateCheckJob(Arc<Inner>);

#[async_trait]
impl PeriodicJob for UpdateCheckJob {
    fn name(&self) -> &'static str {
        "update check"
    }

    fn interval(&self) -> Option<Duration> {
        self.0.config.read().update.check_interval()
    }

    fn retry_interval(&self) -> Duration {
        self.0.config.read().scheduler.retry_interval()
    }

    async fn run(&self, guard: OperationGuard) {
        if self.0.config.read().update.auto_update {
            self.0.run_update(&guard).await;
        } else {
            let servers = self.0.active_servers();
            self.0.checker.check_all(&servers).await;
        }
    }
}
