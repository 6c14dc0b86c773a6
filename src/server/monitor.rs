use crate::config::MonitorSettings;
use crate::rcon::{LIST_PLAYERS, RconConnector};
use crate::server::{ManagedServer, ProcessControl, ServerStatus};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Server monitor
///
/// Reconciles what the crate believes about each server with the process
/// table and the server's RCON port. One polling loop runs per server; the
/// same reconcile step is available on demand through [`refresh`](Self::refresh).
pub struct ServerMonitor {
    processes: Arc<dyn ProcessControl>,
    rcon: Arc<dyn RconConnector>,
    config: MonitorSettings,
}

impl ServerMonitor {
    pub fn new(
        processes: Arc<dyn ProcessControl>,
        rcon: Arc<dyn RconConnector>,
        config: MonitorSettings,
    ) -> Self {
        Self {
            processes,
            rcon,
            config,
        }
    }

    pub fn processes(&self) -> &Arc<dyn ProcessControl> {
        &self.processes
    }

    pub fn rcon(&self) -> &Arc<dyn RconConnector> {
        &self.rcon
    }

    /// Runs one reconcile cycle and returns the resulting status.
    ///
    /// Never fails: a lookup error leaves the previous state untouched for
    /// this cycle.
    ///
    /// - No process: `Stopped`, unless a manual stop (`Stopping`) is in flight.
    ///   `UpdatePending`, `ShuttingDown` and `Updating` are not protected.
    /// - Process and RCON answers: `Running` with the parsed player list.
    /// - Process but RCON refused or timed out: `Starting`.
    /// - Process but any other RCON failure: `Starting` with no players.
    ///
    /// `Error` is left alone in every case until an operator clears it.
    #[tracing::instrument(skip(self, server), fields(server = %server.name()))]
    pub async fn refresh(&self, server: &ManagedServer) -> ServerStatus {
        let state = server.state();

        let process = match self.processes.find(server).await {
            Ok(process) => process,
            Err(e) => {
                tracing::warn!(error = %e, "Process lookup failed");
                return state.status();
            }
        };

        let Some(process) = process else {
            state.clear_process();
            match state.status() {
                ServerStatus::Stopping | ServerStatus::Error => {}
                _ => state.transition(ServerStatus::Stopped, Some("process not found".to_string())),
            }
            return state.status();
        };

        state.set_process(process.pid, process.cpu_percent, process.memory_bytes);
        if state.status() == ServerStatus::Error {
            return ServerStatus::Error;
        }

        match self.rcon.execute(&server.rcon_endpoint(), LIST_PLAYERS).await {
            Ok(response) => {
                state.promote_running(parse_player_list(&response));
            }
            Err(e) if e.is_unreachable() => {
                tracing::debug!(error = %e, "RCON not reachable yet");
                state.transition(ServerStatus::Starting, None);
            }
            Err(e) => {
                tracing::debug!(error = %e, "RCON query failed");
                state.clear_players();
                state.transition(ServerStatus::Starting, None);
            }
        }

        state.status()
    }

    /// Queries the player list without touching the status.
    ///
    /// Used by the shutdown countdown, which owns the status while it runs.
    /// Returns `None` when RCON does not answer.
    pub async fn query_players(&self, server: &ManagedServer) -> Option<u32> {
        match self.rcon.execute(&server.rcon_endpoint(), LIST_PLAYERS).await {
            Ok(response) => {
                server.state().set_roster(parse_player_list(&response));
                Some(server.state().players())
            }
            Err(e) => {
                tracing::debug!(server = %server.name(), error = %e, "Player query failed");
                None
            }
        }
    }

    /// Starts the polling loop for one server.
    ///
    /// Each cycle runs in its own task so a panic inside a collaborator only
    /// costs that cycle.
    pub fn spawn(self: &Arc<Self>, server: Arc<ManagedServer>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = time::interval(monitor.config.poll_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                let cycle_monitor = Arc::clone(&monitor);
                let cycle_server = Arc::clone(&server);
                let cycle =
                    tokio::spawn(async move { cycle_monitor.refresh(&cycle_server).await });

                if let Err(e) = cycle.await {
                    tracing::error!(server = %server.name(), error = %e, "Monitor cycle panicked");
                }
            }
        })
    }

    /// Starts one polling loop per server.
    pub fn spawn_all(self: &Arc<Self>, servers: &[Arc<ManagedServer>]) -> Vec<JoinHandle<()>> {
        servers
            .iter()
            .map(|server| self.spawn(Arc::clone(server)))
            .collect()
    }
}

/// Parses a `listplayers` response into player names.
///
/// An empty response or "No Players Connected" means nobody is online; any
/// other non-empty line is one player, formatted `"<n>. <name>, <id>"`.
pub fn parse_player_list(response: &str) -> Vec<String> {
    if response.contains("No Players Connected") {
        return Vec::new();
    }

    response
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let name = match line.split_once(". ") {
                Some((index, rest)) if index.chars().all(|c| c.is_ascii_digit()) => rest,
                _ => line,
            };
            match name.rsplit_once(',') {
                Some((name, _)) => name.trim().to_string(),
                None => name.to_string(),
            }
        })
        .collect()
}
