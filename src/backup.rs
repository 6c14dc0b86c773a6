//! World backups.
//!
//! A backup run has three phases, each walking the servers one after the other:
//! force a save on every running server and wait for the world file to change,
//! archive every server's save directory, then prune archives past retention.
//! Nothing in one server's backup stops the next server from being processed.
use crate::config::BackupSettings;
use crate::error::{Error, Result};
use crate::lock::OperationGuard;
use crate::rcon::{RconConnector, SAVE_WORLD};
use crate::server::{ManagedServer, ServerStatus};
use chrono::{DateTime, Local};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::{Instant, sleep};
use walkdir::WalkDir;

const ARCHIVE_EXTENSION: &str = ".tar.gz";
const PARTIAL_EXTENSION: &str = ".partial";
const SAVE_POLL: Duration = Duration::from_secs(1);

/// One archive on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArchive {
    pub server: String,
    pub created: DateTime<Local>,
    pub path: PathBuf,
}

/// What a backup run did
#[derive(Debug, Default)]
pub struct BackupReport {
    /// Servers whose save was confirmed on disk before archiving
    pub saved: Vec<String>,
    pub archives: Vec<BackupArchive>,
    /// Server name and error of every archive that could not be written
    pub failures: Vec<(String, String)>,
    pub pruned: usize,
}

/// Saves, archives and prunes world backups.
pub struct BackupOrchestrator {
    rcon: Arc<dyn RconConnector>,
    settings: BackupSettings,
}

impl BackupOrchestrator {
    pub fn new(rcon: Arc<dyn RconConnector>, settings: BackupSettings) -> Self {
        Self { rcon, settings }
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    /// Backs up the given servers. Requires the operation lock.
    #[tracing::instrument(skip(self, _guard, servers), fields(count = servers.len()))]
    pub async fn run(
        &self,
        _guard: &OperationGuard,
        servers: &[Arc<ManagedServer>],
    ) -> BackupReport {
        let mut report = BackupReport::default();

        for server in servers {
            if server.state().status() == ServerStatus::Running && self.save_world(server).await {
                report.saved.push(server.name().to_string());
            }
        }

        for server in servers {
            match self.archive(server).await {
                Ok(archive) => {
                    tracing::info!(server = %server.name(), path = %archive.path.display(), "Backup written");
                    report.archives.push(archive);
                }
                Err(e) => {
                    tracing::warn!(server = %server.name(), error = %e, "Backup failed");
                    report
                        .failures
                        .push((server.name().to_string(), e.to_string()));
                }
            }
        }

        report.pruned = self.sweep(SystemTime::now()).await;
        report
    }

    /// Sends `SaveWorld` and waits for the world file's timestamp to advance.
    ///
    /// Returns `false` when the save could not be confirmed; the backup goes
    /// ahead regardless.
    #[tracing::instrument(skip(self, server), fields(server = %server.name()))]
    pub async fn save_world(&self, server: &ManagedServer) -> bool {
        let world_file = server.world_file();
        let before = world_file.as_deref().and_then(modified);

        if let Err(e) = self.rcon.execute(&server.rcon_endpoint(), SAVE_WORLD).await {
            tracing::warn!(error = %e, "Save command failed");
            return false;
        }

        let Some(world_file) = world_file else {
            tracing::debug!("No world file configured, not waiting for the save");
            return false;
        };

        let deadline = Instant::now() + self.settings.save_wait();
        loop {
            if let Some(now) = modified(&world_file) {
                if before.is_none_or(|before| now > before) {
                    tracing::debug!("World save confirmed");
                    return true;
                }
            }
            if Instant::now() >= deadline {
                tracing::warn!(wait = ?self.settings.save_wait(), "World save not confirmed, archiving anyway");
                return false;
            }
            sleep(SAVE_POLL).await;
        }
    }

    /// Archives one server's save directory.
    pub async fn archive(&self, server: &ManagedServer) -> Result<BackupArchive> {
        let source = server.save_dir();
        let dest_dir = self.settings.root.join(server.name());
        let created = Local::now();
        let stem = format!("{}_{}", server.name(), created.format("%Y-%m-%d_%H-%M-%S"));
        let exclude = self.settings.root.clone();

        let path = tokio::task::spawn_blocking(move || {
            let path = unused_archive_path(&dest_dir, &stem);
            write_archive(&source, &path, &exclude).map(|()| path)
        })
        .await
        .map_err(|e| Error::Backup(format!("archive task failed: {}", e)))??;

        Ok(BackupArchive {
            server: server.name().to_string(),
            created,
            path,
        })
    }

    /// Deletes archives strictly older than the retention window at `now`.
    ///
    /// An archive exactly at the boundary is kept. Returns how many were deleted.
    pub async fn sweep(&self, now: SystemTime) -> usize {
        let root = self.settings.root.clone();
        let retention = self.settings.retention();

        match tokio::task::spawn_blocking(move || prune(&root, retention, now)).await {
            Ok(pruned) => pruned,
            Err(e) => {
                tracing::warn!(error = %e, "Retention sweep failed");
                0
            }
        }
    }

    /// Lists every archive under the backup root, oldest first.
    pub fn list_archives(&self) -> Vec<BackupArchive> {
        let mut archives: Vec<BackupArchive> = archive_files(&self.settings.root)
            .filter_map(|(server, path)| {
                let created = modified(&path)?;
                Some(BackupArchive {
                    server,
                    created: DateTime::<Local>::from(created),
                    path,
                })
            })
            .collect();
        archives.sort_by_key(|a| a.created);
        archives
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn is_internal_temp(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name.ends_with(".tmp") || name.ends_with(PARTIAL_EXTENSION))
}

/// `<stem>.tar.gz`, or `<stem>-N.tar.gz` when an archive from the same second exists.
fn unused_archive_path(dir: &Path, stem: &str) -> PathBuf {
    let first = dir.join(format!("{}{}", stem, ARCHIVE_EXTENSION));
    if !first.exists() {
        return first;
    }
    (1u32..)
        .map(|n| dir.join(format!("{}-{}{}", stem, n, ARCHIVE_EXTENSION)))
        .find(|path| !path.exists())
        .unwrap_or(first)
}

fn write_archive(source: &Path, dest: &Path, exclude: &Path) -> Result<()> {
    if !source.is_dir() {
        return Err(Error::Backup(format!(
            "save directory {} does not exist",
            source.display()
        )));
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let partial = PathBuf::from(format!("{}{}", dest.display(), PARTIAL_EXTENSION));
    let written = write_partial(source, &partial, exclude)
        .and_then(|()| std::fs::rename(&partial, dest).map_err(Error::from));
    if written.is_err() {
        if let Err(e) = std::fs::remove_file(&partial) {
            tracing::debug!(path = %partial.display(), error = %e, "Partial archive not removed");
        }
    }
    written
}

fn write_partial(source: &Path, partial: &Path, exclude: &Path) -> Result<()> {
    let encoder = GzEncoder::new(File::create(partial)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let exclude = exclude.canonicalize().unwrap_or_else(|_| exclude.to_path_buf());
    let walker = WalkDir::new(source).into_iter().filter_entry(|entry| {
        let canonical = entry
            .path()
            .canonicalize()
            .unwrap_or_else(|_| entry.path().to_path_buf());
        !canonical.starts_with(&exclude) && !is_internal_temp(entry.path())
    });

    for entry in walker {
        let entry = entry.map_err(|e| Error::Backup(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| Error::Backup(e.to_string()))?;
        builder.append_path_with_name(entry.path(), relative)?;
    }

    builder.into_inner()?.finish()?;
    Ok(())
}

/// `(server name, archive path)` for every archive below `root`.
fn archive_files(root: &Path) -> impl Iterator<Item = (String, PathBuf)> {
    WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(ARCHIVE_EXTENSION))
        .filter_map(|entry| {
            let server = entry
                .path()
                .parent()?
                .file_name()?
                .to_string_lossy()
                .into_owned();
            Some((server, entry.into_path()))
        })
}

fn prune(root: &Path, retention: Duration, now: SystemTime) -> usize {
    let mut pruned = 0;
    for (server, path) in archive_files(root) {
        let Some(mtime) = modified(&path) else {
            continue;
        };
        let age = now.duration_since(mtime).unwrap_or(Duration::ZERO);
        if age <= retention {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(%server, path = %path.display(), "Expired backup deleted");
                pruned += 1;
            }
            Err(e) => {
                tracing::warn!(%server, path = %path.display(), error = %e, "Failed to delete expired backup")
            }
        }
    }
    pruned
}
