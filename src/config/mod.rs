//! Configuration module for Fleet Warden.
//!
//! This module handles parsing, validation, and shared access to the fleet
//! configuration document. The document is loaded from JSON or YAML; the
//! scheduler and the watchdog write their state back into it through
//! [`ConfigHandle::update`].
//!
//! # Examples
//!
//! Loading a configuration from a file:
//!
//! ```no_run
//! use fleet_warden::config::ConfigHandle;
//!
//! let handle = ConfigHandle::load("fleet.json").unwrap();
//! println!("Managing {} servers", handle.read().servers.len());
//! ```
//!
//! Creating a configuration programmatically:
//!
//! ```
//! use fleet_warden::config::{ConfigHandle, FleetConfig, ServerConfig};
//!
//! let mut config = FleetConfig::default();
//! config.servers.push(ServerConfig::new("island", "/srv/ark/island"));
//! let handle = ConfigHandle::in_memory(config);
//! assert!(handle.read().server("island").is_some());
//! ```
mod parser;
pub mod validator;

pub use parser::{
    BackupSettings, FleetConfig, LoggingSettings, MonitorSettings, SchedulerSettings,
    ServerConfig, ShutdownSettings, UpdateSettings, WatchdogSettings,
};
pub use validator::validate_config;

use crate::error::Result;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard};

/// Shared, optionally file-backed configuration document.
///
/// Reads hand out a snapshot guard; writes go through [`update`](Self::update)
/// which saves the document when it came from a file.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<FleetConfig>>,
    path: Option<PathBuf>,
}

impl ConfigHandle {
    /// Loads, validates and wraps a configuration file.
    ///
    /// Servers without an id get one here; the document is saved right away so
    /// the ids stay stable across restarts.
    #[tracing::instrument(skip(path), fields(config_path = ?path.as_ref()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        tracing::info!("Loading configuration from file");
        let config = FleetConfig::from_file(&path)?;
        validate_config(&config)?;

        let handle = Self {
            inner: Arc::new(RwLock::new(config)),
            path: Some(path),
        };
        handle.persist();
        Ok(handle)
    }

    /// Wraps a configuration that is never written to disk.
    pub fn in_memory(config: FleetConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns a read guard over the current document.
    pub fn read(&self) -> RwLockReadGuard<'_, FleetConfig> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a clone of the current document.
    pub fn snapshot(&self) -> FleetConfig {
        self.read().clone()
    }

    /// Applies an edit and persists the document when it is file-backed.
    ///
    /// Persistence is best-effort: a failed write is logged and the in-memory
    /// edit is kept.
    pub fn update<R>(&self, edit: impl FnOnce(&mut FleetConfig) -> R) -> R {
        let result = {
            let mut guard = self
                .inner
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            edit(&mut guard)
        };
        self.persist();
        result
    }

    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = self.read().save_to_file(path) {
            tracing::warn!(error = %e, path = %path.display(), "Failed to save configuration");
        }
    }
}
