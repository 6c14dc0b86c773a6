//! Periodic fleet status reports.
//!
//! The status table is kept in a single message that is edited in place; the
//! id of that message lives in the configuration document so it survives
//! restarts. Metric graphs go out as an attachment, which the channel cannot
//! swap on edit, so the graph message is deleted and posted again instead.
use crate::config::ConfigHandle;
use crate::error::{Error, Result};
use crate::lock::OperationLock;
use crate::notify::{Attachment, Notifier};
use crate::server::{ManagedServer, MetricSample};
use chrono::Local;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;

/// Renders metric history into something the channel can carry.
pub trait GraphRenderer: Send + Sync {
    fn render(&self, series: &[(String, Vec<MetricSample>)]) -> Result<Attachment>;
}

/// Writes the samples of every server into one CSV table.
#[derive(Debug, Default, Clone, Copy)]
pub struct CsvGraphRenderer;

impl GraphRenderer for CsvGraphRenderer {
    fn render(&self, series: &[(String, Vec<MetricSample>)]) -> Result<Attachment> {
        let mut csv = String::from("server,taken_at,cpu_percent,memory_mb,players\n");
        for (server, samples) in series {
            for sample in samples {
                writeln!(
                    csv,
                    "{},{},{:.1},{},{}",
                    server,
                    sample.taken_at.format("%Y-%m-%dT%H:%M:%S"),
                    sample.cpu_percent,
                    sample.memory_bytes / (1024 * 1024),
                    sample.players
                )
                .map_err(|e| Error::Other(e.to_string()))?;
            }
        }
        Ok(Attachment {
            file_name: "fleet-metrics.csv".to_string(),
            bytes: csv.into_bytes(),
        })
    }
}

/// What one report cycle did with the status message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// An operation held the lock
    Skipped,
    /// No message was remembered; a new one was posted
    Posted(String),
    /// The remembered message was edited
    Edited(String),
    /// The remembered message was gone; a new one was posted
    Reposted(String),
}

/// Pushes the fleet status table and metric graphs to the notifier.
pub struct WatchdogReporter {
    notifier: Arc<dyn Notifier>,
    config: ConfigHandle,
    lock: OperationLock,
    servers: Vec<Arc<ManagedServer>>,
    renderer: Arc<dyn GraphRenderer>,
    cycles: AtomicU64,
}

impl WatchdogReporter {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        config: ConfigHandle,
        lock: OperationLock,
        servers: Vec<Arc<ManagedServer>>,
        renderer: Arc<dyn GraphRenderer>,
    ) -> Self {
        Self {
            notifier,
            config,
            lock,
            servers,
            renderer,
            cycles: AtomicU64::new(0),
        }
    }

    /// Runs one cycle: the status message, plus the graphs when they are due.
    ///
    /// Nothing is sent while a major operation holds the lock.
    #[tracing::instrument(skip(self))]
    pub async fn report_once(&self) -> Result<ReportOutcome> {
        if self.lock.is_held() {
            tracing::debug!(holder = ?self.lock.holder(), "Operation in progress, skipping report");
            return Ok(ReportOutcome::Skipped);
        }

        let outcome = self.push_status().await?;

        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let graph_every = self.config.read().watchdog.graph_every();
        if graph_every.is_some_and(|every| cycle % every == 0) {
            if let Err(e) = self.refresh_graphs().await {
                tracing::warn!(error = %e, "Failed to refresh graphs");
            }
        }

        Ok(outcome)
    }

    async fn push_status(&self) -> Result<ReportOutcome> {
        let content = status_table(&self.servers);
        let remembered = self.config.read().watchdog.status_message_id.clone();

        let stale = match remembered {
            Some(id) => match self.notifier.edit(&id, &content).await {
                Ok(()) => return Ok(ReportOutcome::Edited(id)),
                Err(Error::MessageNotFound(_)) => {
                    tracing::info!(message_id = %id, "Status message gone, posting a new one");
                    self.config
                        .update(|c| c.watchdog.status_message_id = None);
                    true
                }
                Err(e) => return Err(e),
            },
            None => false,
        };

        let id = self.notifier.post(&content).await?;
        self.config
            .update(|c| c.watchdog.status_message_id = Some(id.clone()));
        Ok(if stale {
            ReportOutcome::Reposted(id)
        } else {
            ReportOutcome::Posted(id)
        })
    }

    /// Deletes the previous graph message and posts fresh graphs.
    pub async fn refresh_graphs(&self) -> Result<String> {
        let previous = self.config.read().watchdog.graph_message_id.clone();
        if let Some(id) = previous {
            if let Err(e) = self.notifier.delete(&id).await {
                tracing::debug!(message_id = %id, error = %e, "Old graph message not deleted");
            }
        }

        let series: Vec<(String, Vec<MetricSample>)> = self
            .reported_servers()
            .map(|s| (s.name().to_string(), s.state().samples()))
            .collect();
        let attachment = self.renderer.render(&series)?;
        let id = self
            .notifier
            .post_attachment("Fleet performance", attachment)
            .await?;
        self.config
            .update(|c| c.watchdog.graph_message_id = Some(id.clone()));
        Ok(id)
    }

    fn reported_servers(&self) -> impl Iterator<Item = &Arc<ManagedServer>> {
        self.servers
            .iter()
            .filter(|s| s.is_active() && s.is_installed())
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let every = self.config.read().watchdog.interval();
                tokio::time::sleep(every).await;
                if let Err(e) = self.report_once().await {
                    tracing::warn!(error = %e, "Status report failed");
                }
            }
        })
    }
}

/// Text table of the active, installed servers.
pub fn status_table(servers: &[Arc<ManagedServer>]) -> String {
    let mut table = format!(
        "**Fleet status** ({})\n```\n{:<20} {:<14} {:>7} {:>7} {:>9} {}\n",
        Local::now().format("%Y-%m-%d %H:%M"),
        "Server",
        "Status",
        "Players",
        "CPU",
        "RAM",
        "Update"
    );
    for server in servers.iter().filter(|s| s.is_active() && s.is_installed()) {
        let snap = server.state().snapshot();
        let cpu = snap
            .cpu_percent
            .map(|c| format!("{:.1}%", c))
            .unwrap_or_else(|| "-".to_string());
        let ram = snap
            .memory_bytes
            .map(|m| format!("{} MB", m / (1024 * 1024)))
            .unwrap_or_else(|| "-".to_string());
        let update = if snap.update.as_ref().is_some_and(|u| u.update_available) {
            "available"
        } else {
            "-"
        };
        let _ = writeln!(
            table,
            "{:<20} {:<14} {:>7} {:>7} {:>9} {}",
            server.name(),
            snap.status.to_string(),
            snap.players,
            cpu,
            ram,
            update
        );
    }
    table.push_str("```");
    table
}
