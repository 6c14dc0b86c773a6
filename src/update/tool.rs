use crate::error::{Error, Result};
use async_process::{Command, Stdio};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// The external package-update tool.
///
/// Callers bound the call with a timeout; implementations must make sure
/// the underlying process dies when the returned future is dropped.
#[async_trait]
pub trait UpdateTool: Send + Sync {
    /// Installs or validates `app_id` into `install_dir`.
    async fn install(&self, install_dir: &Path, app_id: &str) -> Result<()>;
}

/// [`UpdateTool`] running SteamCMD with an anonymous login.
pub struct SteamCmd {
    executable: PathBuf,
}

impl SteamCmd {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Arguments for one install-validate-quit run.
    pub fn arguments(install_dir: &Path, app_id: &str) -> Vec<String> {
        vec![
            "+force_install_dir".to_string(),
            install_dir.display().to_string(),
            "+login".to_string(),
            "anonymous".to_string(),
            "+app_update".to_string(),
            app_id.to_string(),
            "validate".to_string(),
            "+quit".to_string(),
        ]
    }
}

#[async_trait]
impl UpdateTool for SteamCmd {
    #[tracing::instrument(skip(self), fields(dir = %install_dir.display()))]
    async fn install(&self, install_dir: &Path, app_id: &str) -> Result<()> {
        let output = Command::new(&self.executable)
            .args(Self::arguments(install_dir, app_id))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::UpdateTool(format!("Failed to start update tool: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            tracing::debug!(target: "fleet_warden::steamcmd", "{}", line);
        }

        if output.status.success() || stdout.contains("Success! App") {
            tracing::info!("Update tool finished");
            Ok(())
        } else {
            let tail: Vec<&str> = stdout.lines().rev().take(3).collect();
            Err(Error::UpdateTool(format!(
                "exit status {}: {}",
                output.status,
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            )))
        }
    }
}
