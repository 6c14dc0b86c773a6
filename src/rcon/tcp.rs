use super::packet::{Packet, PacketKind, payload_len};
use super::{RconConnector, RconEndpoint};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const AUTH_ID: i32 = 1;
const COMMAND_ID: i32 = 2;
/// Id of the empty command sent after the real one. Its reply marks the end of
/// a response split across several packets.
const SENTINEL_ID: i32 = 3;

/// RCON over TCP, one connection per command.
///
/// Connecting, authenticating and reading are each bounded by the configured
/// timeout. Responses split over several packets are joined: an empty command
/// follows the real one, and its reply ends the response. Refused connections and timeouts are reported as
/// [`Error::RconUnreachable`], which callers treat as "not up yet".
///
/// # Example
///
/// ```no_run
/// use fleet_warden::rcon::{RconConnector, RconEndpoint, TcpRcon};
/// use std::time::Duration;
///
/// # async fn example() -> fleet_warden::Result<()> {
/// let rcon = TcpRcon::new(Duration::from_secs(5));
/// let endpoint = RconEndpoint {
///     host: "127.0.0.1".to_string(),
///     port: 27020,
///     password: "secret".to_string(),
/// };
/// let players = rcon.execute(&endpoint, "listplayers").await?;
/// println!("{}", players);
/// # Ok(())
/// # }
/// ```
pub struct TcpRcon {
    timeout: Duration,
}

impl TcpRcon {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn connect(&self, endpoint: &RconEndpoint) -> Result<TcpStream> {
        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        match timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(map_io(e, &addr)),
            Err(_) => Err(Error::RconUnreachable(format!("connect to {} timed out", addr))),
        }
    }

    async fn read_packet(&self, stream: &mut TcpStream) -> Result<Packet> {
        let read = async {
            let mut prefix = [0u8; 4];
            stream
                .read_exact(&mut prefix)
                .await
                .map_err(|e| map_io(e, "rcon peer"))?;
            let len = payload_len(prefix)?;
            let mut payload = vec![0u8; len];
            stream
                .read_exact(&mut payload)
                .await
                .map_err(|e| map_io(e, "rcon peer"))?;
            Packet::decode(&payload)
        };

        match timeout(self.timeout, read).await {
            Ok(result) => result,
            Err(_) => Err(Error::RconUnreachable("read timed out".to_string())),
        }
    }

    async fn write_packet(&self, stream: &mut TcpStream, packet: &Packet) -> Result<()> {
        stream
            .write_all(&packet.encode())
            .await
            .map_err(|e| map_io(e, "rcon peer"))
    }
}

fn map_io(e: io::Error, addr: &str) -> Error {
    match e.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::TimedOut
        | io::ErrorKind::UnexpectedEof => Error::RconUnreachable(format!("{}: {}", addr, e)),
        _ => Error::Rcon(format!("{}: {}", addr, e)),
    }
}

#[async_trait]
impl RconConnector for TcpRcon {
    #[tracing::instrument(skip(self, endpoint), fields(port = endpoint.port))]
    async fn execute(&self, endpoint: &RconEndpoint, command: &str) -> Result<String> {
        let mut stream = self.connect(endpoint).await?;

        self.write_packet(&mut stream, &Packet::new(AUTH_ID, PacketKind::Auth, &endpoint.password))
            .await?;
        loop {
            let packet = self.read_packet(&mut stream).await?;
            if packet.is(PacketKind::AuthResponse) {
                if packet.id == -1 {
                    return Err(Error::Rcon("authentication rejected".to_string()));
                }
                break;
            }
        }

        self.write_packet(
            &mut stream,
            &Packet::new(COMMAND_ID, PacketKind::ExecCommand, command),
        )
        .await?;
        self.write_packet(&mut stream, &Packet::new(SENTINEL_ID, PacketKind::ExecCommand, ""))
            .await?;

        let mut body = String::new();
        let mut packets = 0usize;
        loop {
            let packet = self.read_packet(&mut stream).await?;
            if packet.id == SENTINEL_ID {
                tracing::trace!(bytes = body.len(), packets, "RCON response received");
                return Ok(body);
            }
            if packet.id == COMMAND_ID && packet.is(PacketKind::ResponseValue) {
                body.push_str(&packet.body);
                packets += 1;
            }
        }
    }
}
