/// Error handling module for Fleet Warden.
///
/// This module defines the error types used throughout the library.
/// Most fleet operations never surface these to their callers: pipelines resolve
/// failures into a terminal [`ServerStatus`](crate::server::ServerStatus) instead.
/// Errors are what the collaborators (RCON, process control, update tool,
/// notification channel) hand back to the pipelines, and what the manual
/// entry points of [`FleetManager`](crate::FleetManager) return.
///
/// # Example
///
/// ```
/// use fleet_warden::error::{Error, Result};
///
/// fn handle_error(result: Result<()>) {
///     match result {
///         Ok(_) => println!("Operation succeeded"),
///         Err(Error::OperationInProgress(op)) => println!("Skipped, '{}' is running", op),
///         Err(Error::ServerNotFound(name)) => println!("Server '{}' not configured", name),
///         Err(e) if e.is_unreachable() => println!("Server not accepting RCON yet: {}", e),
///         Err(e) => println!("Other error: {}", e),
///     }
/// }
/// ```
use thiserror::Error;

/// Errors that can occur in the fleet-warden library.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to parse configuration from a file or string.
    ///
    /// This error occurs when:
    /// - The configuration document is malformed JSON or YAML
    /// - Required fields are missing
    /// - Field types are incorrect
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration parses but contains invalid values.
    ///
    /// This error occurs when:
    /// - Two servers share a name or an id
    /// - A port is zero
    /// - Two scheduled tasks share an id
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Error when locating, launching or terminating a server process.
    #[error("Server process error: {0}")]
    Process(String),

    /// The RCON endpoint answered but the exchange failed.
    ///
    /// This error occurs when:
    /// - Authentication is rejected
    /// - A response packet is malformed
    #[error("RCON error: {0}")]
    Rcon(String),

    /// The RCON endpoint could not be reached (refused or timed out).
    ///
    /// This is the expected state of a server that is still loading its world,
    /// and is never reported as a failure.
    #[error("RCON unreachable: {0}")]
    RconUnreachable(String),

    /// Requested server was not found in the configuration.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// Requested scheduled task was not found in the configuration.
    #[error("Scheduled task not found: {0}")]
    TaskNotFound(String),

    /// A bounded operation ran out of time.
    ///
    /// This error occurs when:
    /// - The update tool runs past its wall-clock limit
    /// - A process does not exit after the stop command
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Another major operation holds the operation lock.
    #[error("Major operation already in progress: {0}")]
    OperationInProgress(String),

    /// The package-update tool exited unsuccessfully or could not be spawned.
    #[error("Update tool error: {0}")]
    UpdateTool(String),

    /// Error talking to an HTTP endpoint (build feed, webhook).
    #[error("HTTP error: {0}")]
    Http(String),

    /// The notification channel rejected a request.
    #[error("Notification error: {0}")]
    Notification(String),

    /// A remembered message id no longer exists on the notification channel.
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Creating or pruning a backup archive failed.
    #[error("Backup error: {0}")]
    Backup(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error in serializing or deserializing data.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A status change that only the monitor may perform was attempted elsewhere.
    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    /// Any other error not covered by the above categories.
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Returns `true` for transient unreachability of an RCON endpoint.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Error::RconUnreachable(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type for fleet-warden operations.
pub type Result<T> = std::result::Result<T, Error>;
