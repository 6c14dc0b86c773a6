//! Remote console access to running servers.
//!
//! [`RconConnector`] is the seam the monitor, the shutdown protocol and the
//! backup orchestrator talk through; [`TcpRcon`] implements it over the Source
//! RCON wire format in [`packet`].
mod packet;
mod tcp;

pub use packet::{MAX_PACKET_SIZE, Packet, PacketKind};
pub use tcp::TcpRcon;

use crate::error::Result;
use async_trait::async_trait;

/// Forces a world save.
pub const SAVE_WORLD: &str = "SaveWorld";
/// Saves and exits the server process.
pub const DO_EXIT: &str = "DoExit";
/// Lists connected players, one per line.
pub const LIST_PLAYERS: &str = "listplayers";

/// Builds a chat broadcast command.
pub fn server_chat(text: &str) -> String {
    format!("ServerChat {}", text)
}

/// Address and credentials of one server's RCON port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconEndpoint {
    pub host: String,
    pub port: u16,
    pub password: String,
}

/// Executes console commands on a server.
#[async_trait]
pub trait RconConnector: Send + Sync {
    /// Runs one command and returns the response text.
    ///
    /// # Errors
    ///
    /// [`Error::RconUnreachable`](crate::Error::RconUnreachable) when the endpoint
    /// refuses or times out, [`Error::Rcon`](crate::Error::Rcon) for any other
    /// protocol failure.
    async fn execute(&self, endpoint: &RconEndpoint, command: &str) -> Result<String>;
}
