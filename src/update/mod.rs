//! Update detection and the per-server update pipeline.
//!
//! Each server that needs an update is taken down, updated and brought back
//! in its own task. Shutdown and restart run in parallel across servers; the
//! update tool itself runs for one server at a time behind a capacity-1 gate.
mod feed;
mod tool;

pub use feed::{BuildFeed, HttpBuildFeed, UnknownBuildFeed, extract_build_id, installed_build_id};
pub use tool::{SteamCmd, UpdateTool};

use crate::config::UpdateSettings;
use crate::lock::OperationGuard;
use crate::notify::{Notifier, announce};
use crate::server::{ManagedServer, ProcessControl, ServerId, ServerStatus};
use crate::shutdown::{GracefulShutdown, ShutdownReason, force_kill};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};

/// Installed vs. published build of one server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCheckResult {
    pub installed_build: Option<String>,
    pub latest_build: Option<String>,
    pub update_available: bool,
}

impl UpdateCheckResult {
    /// An update is only reported when both builds are known and differ.
    pub fn new(installed_build: Option<String>, latest_build: Option<String>) -> Self {
        let update_available = match (&installed_build, &latest_build) {
            (Some(installed), Some(latest)) => installed != latest,
            _ => false,
        };
        Self {
            installed_build,
            latest_build,
            update_available,
        }
    }
}

/// Compares installed builds against the build feed.
pub struct UpdateChecker {
    feed: Arc<dyn BuildFeed>,
    app_id: String,
}

impl UpdateChecker {
    pub fn new(feed: Arc<dyn BuildFeed>, app_id: impl Into<String>) -> Self {
        Self {
            feed,
            app_id: app_id.into(),
        }
    }

    /// Checks one server and stores the result on it.
    pub async fn check(&self, server: &ManagedServer) -> UpdateCheckResult {
        let latest = self.feed.latest_build().await;
        self.record(server, latest)
    }

    /// Checks every server against a single feed lookup.
    #[tracing::instrument(skip(self, servers), fields(count = servers.len()))]
    pub async fn check_all(&self, servers: &[Arc<ManagedServer>]) -> Vec<UpdateCheckResult> {
        let latest = self.feed.latest_build().await;
        if latest.is_none() {
            tracing::info!("Latest build unknown, no updates reported");
        }
        servers
            .iter()
            .map(|server| self.record(server, latest.clone()))
            .collect()
    }

    fn record(&self, server: &ManagedServer, latest: Option<String>) -> UpdateCheckResult {
        let installed = installed_build_id(server.install_dir(), &self.app_id);
        let result = UpdateCheckResult::new(installed, latest);
        if result.update_available {
            tracing::info!(
                server = %server.name(),
                installed = ?result.installed_build,
                latest = ?result.latest_build,
                "Update available"
            );
        }
        server.state().set_update_check(result.clone());
        result
    }
}

/// Result of one server's pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Updated; `restarted` tells whether the server was launched again
    Updated { restarted: bool },
    /// Left in `Error` with the reason
    Failed(String),
}

/// Outcome per server of an update run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUpdate {
    pub server: ServerId,
    pub name: String,
    pub outcome: UpdateOutcome,
}

/// Shuts down, updates and restarts servers.
pub struct UpdatePipeline {
    shutdown: Arc<GracefulShutdown>,
    processes: Arc<dyn ProcessControl>,
    tool: Arc<dyn UpdateTool>,
    checker: Arc<UpdateChecker>,
    notifier: Arc<dyn Notifier>,
    settings: UpdateSettings,
    tool_gate: Arc<Semaphore>,
}

impl UpdatePipeline {
    pub fn new(
        shutdown: Arc<GracefulShutdown>,
        processes: Arc<dyn ProcessControl>,
        tool: Arc<dyn UpdateTool>,
        checker: Arc<UpdateChecker>,
        notifier: Arc<dyn Notifier>,
        settings: UpdateSettings,
    ) -> Self {
        Self {
            shutdown,
            processes,
            tool,
            checker,
            notifier,
            settings,
            tool_gate: Arc::new(Semaphore::new(1)),
        }
    }

    /// Updates the given servers concurrently.
    ///
    /// Requires the operation lock. Failures never propagate: a failed server
    /// is left in `Error` and reported in the returned outcomes.
    #[tracing::instrument(skip(self, _guard, servers), fields(count = servers.len()))]
    pub async fn run(
        &self,
        _guard: &OperationGuard,
        servers: &[Arc<ManagedServer>],
    ) -> Vec<ServerUpdate> {
        if servers.is_empty() {
            return Vec::new();
        }

        let names: Vec<&str> = servers.iter().map(|s| s.name()).collect();
        announce(
            self.notifier.as_ref(),
            &format!("Starting update for: {}", names.join(", ")),
        )
        .await;

        let results = join_all(servers.iter().map(|server| async move {
            ServerUpdate {
                server: server.id(),
                name: server.name().to_string(),
                outcome: self.update_one(server).await,
            }
        }))
        .await;

        let failed = results
            .iter()
            .filter(|r| matches!(r.outcome, UpdateOutcome::Failed(_)))
            .count();
        announce(
            self.notifier.as_ref(),
            &format!(
                "Update finished: {} succeeded, {} failed",
                results.len() - failed,
                failed
            ),
        )
        .await;

        results
    }

    #[tracing::instrument(skip(self, server), fields(server = %server.name()))]
    async fn update_one(&self, server: &Arc<ManagedServer>) -> UpdateOutcome {
        let state = server.state();
        let prior = state.status();
        // A server caught while still starting is killed and left stopped.
        let restart = prior == ServerStatus::Running;

        match prior {
            ServerStatus::Running => {
                self.shutdown
                    .run(std::slice::from_ref(server), ShutdownReason::Update)
                    .await;
            }
            ServerStatus::Starting => {
                tracing::info!("Server still starting, killing it without warnings");
                force_kill(self.processes.as_ref(), server).await;
            }
            _ => {}
        }

        if !self.confirm_exit(server).await {
            return self
                .fail(server, "process still running after shutdown".to_string())
                .await;
        }
        state.clear_process();
        state.transition(ServerStatus::Stopped, None);

        let tool_result = {
            let _permit = match self.tool_gate.acquire().await {
                Ok(permit) => permit,
                Err(_) => return self.fail(server, "update gate closed".to_string()).await,
            };
            state.transition(ServerStatus::Updating, None);
            let limit = self.settings.tool_timeout();
            tracing::info!(?limit, "Running update tool");
            timeout(
                limit,
                self.tool.install(server.install_dir(), &self.settings.app_id),
            )
            .await
        };

        match tool_result {
            Err(_) => {
                return self
                    .fail(
                        server,
                        format!(
                            "update tool timed out after {}s",
                            self.settings.tool_timeout().as_secs()
                        ),
                    )
                    .await;
            }
            Ok(Err(e)) => return self.fail(server, e.to_string()).await,
            Ok(Ok(())) => {}
        }

        state.transition(ServerStatus::Stopped, Some("update installed".to_string()));
        let check = self.checker.check(server).await;
        tracing::info!(installed = ?check.installed_build, "Update installed");

        if !restart {
            return UpdateOutcome::Updated { restarted: false };
        }

        match self.processes.launch(server).await {
            Ok(pid) => {
                tracing::info!(pid, "Server restarted after update");
                state.transition(ServerStatus::Starting, Some("relaunched".to_string()));
                UpdateOutcome::Updated { restarted: true }
            }
            Err(e) => self.fail(server, format!("restart failed: {}", e)).await,
        }
    }

    /// Checks up to `exit_confirm_attempts` times, one second apart, that the process is gone.
    async fn confirm_exit(&self, server: &ManagedServer) -> bool {
        let attempts = self.settings.exit_confirm_attempts.max(1);
        for attempt in 1..=attempts {
            if let Ok(None) = self.processes.find(server).await {
                return true;
            }
            tracing::debug!(attempt, "Process still present");
            if attempt < attempts {
                sleep(Duration::from_secs(1)).await;
            }
        }
        false
    }

    async fn fail(&self, server: &ManagedServer, reason: String) -> UpdateOutcome {
        tracing::error!(server = %server.name(), %reason, "Update failed");
        server
            .state()
            .transition(ServerStatus::Error, Some(reason.clone()));
        announce(
            self.notifier.as_ref(),
            &format!("Update of {} failed: {}", server.name(), reason),
        )
        .await;
        UpdateOutcome::Failed(reason)
    }
}
