//! Graceful shutdown with player warnings.
//!
//! A batch of servers is counted down together: players are warned once per
//! minute boundary, a server leaves the countdown early as soon as it is
//! empty, and every server is stopped with `DoExit` once its countdown ends.
//! Processes that are still alive after the exit wait are killed. Whatever
//! happens, every server in the batch ends up `Stopped`.
use crate::config::ShutdownSettings;
use crate::notify::{Notifier, announce};
use crate::rcon::{DO_EXIT, SAVE_WORLD, server_chat};
use crate::server::{ManagedServer, ProcessControl, ServerMonitor, ServerStatus};
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};

const EXIT_POLL: Duration = Duration::from_secs(1);

/// Why servers are being shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Update,
    Maintenance,
    DailyRestart,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShutdownReason::Update => "update",
            ShutdownReason::Maintenance => "maintenance",
            ShutdownReason::DailyRestart => "daily restart",
        })
    }
}

/// How a server left its countdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownEnd {
    /// Nobody was online any more
    Empty,
    /// The countdown ran out with players still online
    Forced,
}

fn minutes(n: u64) -> String {
    if n == 1 {
        "1 minute".to_string()
    } else {
        format!("{} minutes", n)
    }
}

fn ceil_minutes(d: Duration) -> u64 {
    d.as_secs().div_ceil(60)
}

/// Runs the countdown-then-stop protocol.
pub struct GracefulShutdown {
    monitor: Arc<ServerMonitor>,
    notifier: Arc<dyn Notifier>,
    settings: ShutdownSettings,
}

impl GracefulShutdown {
    pub fn new(
        monitor: Arc<ServerMonitor>,
        notifier: Arc<dyn Notifier>,
        settings: ShutdownSettings,
    ) -> Self {
        Self {
            monitor,
            notifier,
            settings,
        }
    }

    fn processes(&self) -> &Arc<dyn ProcessControl> {
        self.monitor.processes()
    }

    /// Shuts down a batch of running servers.
    ///
    /// Countdowns run concurrently; exit waits start once every server in the
    /// batch has been sent its stop command.
    #[tracing::instrument(skip(self, servers), fields(count = servers.len(), reason = %reason))]
    pub async fn run(
        &self,
        servers: &[Arc<ManagedServer>],
        reason: ShutdownReason,
    ) -> Vec<CountdownEnd> {
        let ends = join_all(servers.iter().map(|s| self.countdown_and_stop(s, reason))).await;
        join_all(servers.iter().map(|s| self.await_exit(s))).await;
        ends
    }

    async fn countdown_and_stop(
        &self,
        server: &ManagedServer,
        reason: ShutdownReason,
    ) -> CountdownEnd {
        let end = self.countdown(server, reason).await;
        self.issue_stop(server, reason, end).await;
        end
    }

    /// Warns players until the server is empty or the timeout elapses.
    #[tracing::instrument(skip(self, server), fields(server = %server.name()))]
    pub async fn countdown(&self, server: &ManagedServer, reason: ShutdownReason) -> CountdownEnd {
        let state = server.state();
        let total = self.settings.timeout();
        let mut last_announced = ceil_minutes(total);

        state.transition(
            ServerStatus::UpdatePending,
            Some(format!("{} countdown", reason)),
        );
        self.chat(
            server,
            &format!(
                "Server will shut down for {} in {}.",
                reason,
                minutes(last_announced)
            ),
        )
        .await;
        announce(
            self.notifier.as_ref(),
            &format!(
                "{}: shutting down for {} in {}",
                server.name(),
                reason,
                minutes(last_announced)
            ),
        )
        .await;

        let started = Instant::now();
        loop {
            if self.is_empty(server).await {
                tracing::info!("Server is empty, ending countdown");
                return CountdownEnd::Empty;
            }

            let elapsed = started.elapsed();
            if elapsed >= total {
                tracing::info!("Countdown elapsed with players online");
                return CountdownEnd::Forced;
            }

            let remaining = total - elapsed;
            let remaining_minutes = ceil_minutes(remaining);
            if remaining_minutes < last_announced {
                last_announced = remaining_minutes;
                let roster = state.roster();
                let online = if roster.is_empty() {
                    "nobody".to_string()
                } else {
                    roster.join(", ")
                };
                self.chat(
                    server,
                    &format!(
                        "Server will shut down for {} in {}. Online: {}",
                        reason,
                        minutes(remaining_minutes),
                        online
                    ),
                )
                .await;
            }

            sleep(self.settings.poll_interval().min(remaining)).await;
        }
    }

    async fn is_empty(&self, server: &ManagedServer) -> bool {
        if let Some(players) = self.monitor.query_players(server).await {
            return players == 0;
        }
        // RCON silent: empty only if the process itself is gone.
        matches!(self.processes().find(server).await, Ok(None))
    }

    async fn issue_stop(&self, server: &ManagedServer, reason: ShutdownReason, end: CountdownEnd) {
        server
            .state()
            .transition(ServerStatus::ShuttingDown, Some(format!("{:?}", end)));

        let farewell = match end {
            CountdownEnd::Empty => format!("Server is empty. Shutting down for {} now.", reason),
            CountdownEnd::Forced => format!("Final shutdown for {} now.", reason),
        };
        self.chat(server, &farewell).await;

        if let Err(e) = self
            .monitor
            .rcon()
            .execute(&server.rcon_endpoint(), DO_EXIT)
            .await
        {
            tracing::warn!(server = %server.name(), error = %e, "Stop command failed");
        }
    }

    /// Waits for the process to exit, kills it on timeout, and marks it `Stopped`.
    async fn await_exit(&self, server: &ManagedServer) {
        let wait = self.settings.exit_wait();
        if !wait_for_exit(self.processes().as_ref(), server, wait).await {
            tracing::warn!(server = %server.name(), ?wait, "Process did not exit, killing it");
            force_kill(self.processes().as_ref(), server).await;
        }
        server.state().clear_process();
        server
            .state()
            .transition(ServerStatus::Stopped, Some("shutdown complete".to_string()));
    }

    /// Stops a server right away: save, exit, wait, kill.
    ///
    /// The status stays `Stopping` until the process is gone.
    #[tracing::instrument(skip(self, server), fields(server = %server.name()))]
    pub async fn stop_now(&self, server: &ManagedServer) {
        server
            .state()
            .transition(ServerStatus::Stopping, Some("manual stop".to_string()));

        let endpoint = server.rcon_endpoint();
        for command in [SAVE_WORLD, DO_EXIT] {
            if let Err(e) = self.monitor.rcon().execute(&endpoint, command).await {
                tracing::debug!(command, error = %e, "Stop command not delivered");
            }
        }

        self.await_exit(server).await;
    }

    async fn chat(&self, server: &ManagedServer, text: &str) {
        if let Err(e) = self
            .monitor
            .rcon()
            .execute(&server.rcon_endpoint(), &server_chat(text))
            .await
        {
            tracing::debug!(server = %server.name(), error = %e, "Chat broadcast failed");
        }
    }
}

/// Polls once a second until the server's process is gone.
///
/// Returns `false` when it is still alive after `wait`.
pub(crate) async fn wait_for_exit(
    processes: &dyn ProcessControl,
    server: &ManagedServer,
    wait: Duration,
) -> bool {
    let deadline = Instant::now() + wait;
    loop {
        match processes.find(server).await {
            Ok(None) => return true,
            Ok(Some(_)) => {}
            Err(e) => tracing::debug!(error = %e, "Process lookup failed while waiting for exit"),
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(EXIT_POLL).await;
    }
}

/// Kills the server's process if one is found.
pub(crate) async fn force_kill(processes: &dyn ProcessControl, server: &ManagedServer) {
    match processes.find(server).await {
        Ok(Some(process)) => {
            if let Err(e) = processes.kill(process.pid).await {
                tracing::error!(server = %server.name(), error = %e, "Failed to kill process");
            }
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(server = %server.name(), error = %e, "Process lookup failed"),
    }
}
