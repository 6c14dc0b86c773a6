use crate::config::{FleetConfig, ServerConfig};
use crate::error::{Error, Result};
use std::collections::HashSet;

/// Validates a server configuration
pub fn validate_server_config(config: &ServerConfig) -> Result<()> {
    if config.name.trim().is_empty() {
        return Err(Error::ConfigInvalid(format!(
            "Server {} has an empty name",
            config.id
        )));
    }

    if config.install_dir.as_os_str().is_empty() {
        return Err(Error::ConfigInvalid(format!(
            "Server '{}' has no install directory",
            config.name
        )));
    }

    if config.executable.file_name().is_none() {
        return Err(Error::ConfigInvalid(format!(
            "Server '{}' has no executable",
            config.name
        )));
    }

    if config.game_port == 0 || config.query_port == 0 || config.rcon_port == 0 {
        return Err(Error::ConfigInvalid(format!(
            "Server '{}' has an unset port",
            config.name
        )));
    }

    Ok(())
}

/// Validates the server list as a whole
pub fn validate_server_configs(configs: &[ServerConfig]) -> Result<()> {
    let mut names = HashSet::new();
    let mut ids = HashSet::new();

    for config in configs {
        validate_server_config(config)?;

        if !names.insert(config.name.as_str()) {
            return Err(Error::ConfigInvalid(format!(
                "Server name '{}' is used twice",
                config.name
            )));
        }
        if !ids.insert(config.id) {
            return Err(Error::ConfigInvalid(format!(
                "Server id {} is used twice",
                config.id
            )));
        }
    }

    Ok(())
}

/// Full configuration validation
pub fn validate_config(config: &FleetConfig) -> Result<()> {
    validate_server_configs(&config.servers)?;

    let mut task_ids = HashSet::new();
    for task in &config.scheduler.tasks {
        if !task_ids.insert(task.id) {
            return Err(Error::ConfigInvalid(format!(
                "Scheduled task id {} is used twice",
                task.id
            )));
        }
    }

    if config.update.app_id.trim().is_empty() {
        return Err(Error::ConfigInvalid("update.app_id is empty".to_string()));
    }

    Ok(())
}
