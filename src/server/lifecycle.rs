use crate::error::{Error, Result};
use crate::update::UpdateCheckResult;
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

const MAX_HISTORY: usize = 1000;
const MAX_SAMPLES: usize = 360;

/// Status of a managed server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerStatus {
    /// No process found
    Stopped,
    /// Process exists but RCON is not answering yet
    Starting,
    /// Process exists and RCON answered
    Running,
    /// A manual or emergency stop is in flight
    Stopping,
    /// Graceful shutdown countdown active
    UpdatePending,
    /// Final stop command issued
    ShuttingDown,
    /// The update tool is running against the install
    Updating,
    /// A pipeline failed; needs an operator
    Error,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServerStatus::Stopped => "Stopped",
            ServerStatus::Starting => "Starting",
            ServerStatus::Running => "Running",
            ServerStatus::Stopping => "Stopping",
            ServerStatus::UpdatePending => "Update pending",
            ServerStatus::ShuttingDown => "Shutting down",
            ServerStatus::Updating => "Updating",
            ServerStatus::Error => "Error",
        };
        f.write_str(label)
    }
}

/// A recorded status transition
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub from: ServerStatus,
    pub to: ServerStatus,
    pub timestamp: Instant,
    pub details: Option<String>,
}

/// One CPU/RAM/player sample taken by the monitor
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub taken_at: DateTime<Local>,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub players: u32,
}

/// Point-in-time copy of a server's runtime fields
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSnapshot {
    pub status: ServerStatus,
    pub pid: Option<u32>,
    pub players: u32,
    pub roster: Vec<String>,
    pub cpu_percent: Option<f32>,
    pub memory_bytes: Option<u64>,
    pub update: Option<UpdateCheckResult>,
}

#[derive(Debug)]
struct Runtime {
    status: ServerStatus,
    pid: Option<u32>,
    players: u32,
    roster: Vec<String>,
    cpu_percent: Option<f32>,
    memory_bytes: Option<u64>,
    update: Option<UpdateCheckResult>,
}

/// Mutable runtime state of one server.
///
/// Written by the monitor and by the shutdown and update pipelines, read by
/// everyone else. Every status change is appended to a bounded history.
/// Only the monitor may promote a server to [`ServerStatus::Running`].
pub struct ServerState {
    runtime: Mutex<Runtime>,
    history: Mutex<VecDeque<StatusEvent>>,
    samples: Mutex<VecDeque<MetricSample>>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            runtime: Mutex::new(Runtime {
                status: ServerStatus::Stopped,
                pid: None,
                players: 0,
                roster: Vec::new(),
                cpu_percent: None,
                memory_bytes: None,
                update: None,
            }),
            history: Mutex::new(VecDeque::new()),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn status(&self) -> ServerStatus {
        self.runtime().status
    }

    pub fn players(&self) -> u32 {
        self.runtime().players
    }

    pub fn roster(&self) -> Vec<String> {
        self.runtime().roster.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.runtime().pid
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        let rt = self.runtime();
        ServerSnapshot {
            status: rt.status,
            pid: rt.pid,
            players: rt.players,
            roster: rt.roster.clone(),
            cpu_percent: rt.cpu_percent,
            memory_bytes: rt.memory_bytes,
            update: rt.update.clone(),
        }
    }

    /// Sets a pipeline-owned status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] for [`ServerStatus::Running`], which
    /// only the monitor may set after RCON answered.
    pub fn set_status(&self, status: ServerStatus, details: Option<String>) -> Result<()> {
        if status == ServerStatus::Running {
            return Err(Error::InvalidTransition(
                "only the monitor may mark a server running".to_string(),
            ));
        }
        self.transition(status, details);
        Ok(())
    }

    pub(crate) fn transition(&self, to: ServerStatus, details: Option<String>) {
        let from = {
            let mut rt = self.runtime();
            let from = rt.status;
            rt.status = to;
            from
        };
        if from == to {
            return;
        }

        // The caller's span carries the server name.
        match to {
            ServerStatus::Error => {
                tracing::error!(from = ?from, to = ?to, details = ?details, "Server status changed")
            }
            _ => tracing::info!(from = ?from, to = ?to, details = ?details, "Server status changed"),
        }

        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.push_back(StatusEvent {
            from,
            to,
            timestamp: Instant::now(),
            details,
        });
        if history.len() > MAX_HISTORY {
            history.pop_front();
        }
    }

    /// Monitor-only: RCON answered.
    pub(crate) fn promote_running(&self, roster: Vec<String>) {
        {
            let mut rt = self.runtime();
            rt.players = roster.len() as u32;
            rt.roster = roster;
        }
        self.transition(ServerStatus::Running, None);
    }

    pub(crate) fn set_roster(&self, roster: Vec<String>) {
        let mut rt = self.runtime();
        rt.players = roster.len() as u32;
        rt.roster = roster;
    }

    pub(crate) fn clear_players(&self) {
        let mut rt = self.runtime();
        rt.players = 0;
        rt.roster.clear();
    }

    pub(crate) fn set_process(&self, pid: u32, cpu_percent: f32, memory_bytes: u64) {
        let players = {
            let mut rt = self.runtime();
            rt.pid = Some(pid);
            rt.cpu_percent = Some(cpu_percent);
            rt.memory_bytes = Some(memory_bytes);
            rt.players
        };

        let mut samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        samples.push_back(MetricSample {
            taken_at: Local::now(),
            cpu_percent,
            memory_bytes,
            players,
        });
        if samples.len() > MAX_SAMPLES {
            samples.pop_front();
        }
    }

    /// Forgets pid, players and metrics after the process disappeared.
    pub(crate) fn clear_process(&self) {
        let mut rt = self.runtime();
        rt.pid = None;
        rt.players = 0;
        rt.roster.clear();
        rt.cpu_percent = None;
        rt.memory_bytes = None;
    }

    pub fn update_check(&self) -> Option<UpdateCheckResult> {
        self.runtime().update.clone()
    }

    pub fn update_available(&self) -> bool {
        self.runtime()
            .update
            .as_ref()
            .is_some_and(|u| u.update_available)
    }

    pub(crate) fn set_update_check(&self, result: UpdateCheckResult) {
        self.runtime().update = Some(result);
    }

    /// Status transitions, oldest first.
    pub fn history(&self) -> Vec<StatusEvent> {
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.iter().cloned().collect()
    }

    /// The sequence of statuses the server has been in, starting with the initial one.
    pub fn status_trail(&self) -> Vec<ServerStatus> {
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        let mut trail = Vec::with_capacity(history.len() + 1);
        match history.front() {
            Some(first) => trail.push(first.from),
            None => trail.push(self.status()),
        }
        trail.extend(history.iter().map(|e| e.to));
        trail
    }

    pub fn samples(&self) -> Vec<MetricSample> {
        let samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        samples.iter().cloned().collect()
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}
