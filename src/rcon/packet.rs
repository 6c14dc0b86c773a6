use crate::error::{Error, Result};

/// Largest packet body a server is allowed to send.
pub const MAX_PACKET_SIZE: usize = 4096 * 4;

/// Packet types of the Source RCON protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// `SERVERDATA_AUTH`
    Auth,
    /// `SERVERDATA_AUTH_RESPONSE`, shares its wire value with exec commands
    AuthResponse,
    /// `SERVERDATA_EXECCOMMAND`
    ExecCommand,
    /// `SERVERDATA_RESPONSE_VALUE`
    ResponseValue,
}

impl PacketKind {
    fn to_wire(self) -> i32 {
        match self {
            PacketKind::Auth => 3,
            PacketKind::AuthResponse | PacketKind::ExecCommand => 2,
            PacketKind::ResponseValue => 0,
        }
    }
}

/// An RCON packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub kind: i32,
    pub body: String,
}

impl Packet {
    pub fn new(id: i32, kind: PacketKind, body: impl Into<String>) -> Self {
        Self {
            id,
            kind: kind.to_wire(),
            body: body.into(),
        }
    }

    pub fn is(&self, kind: PacketKind) -> bool {
        self.kind == kind.to_wire()
    }

    /// Encodes the packet with its little-endian length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let body = self.body.as_bytes();
        let size = (4 + 4 + body.len() + 2) as i32;

        let mut buf = Vec::with_capacity(size as usize + 4);
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.kind.to_le_bytes());
        buf.extend_from_slice(body);
        buf.extend_from_slice(&[0, 0]);
        buf
    }

    /// Decodes a packet payload, i.e. everything after the length prefix.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 10 {
            return Err(Error::Rcon(format!(
                "Packet too short: {} bytes",
                payload.len()
            )));
        }

        let id = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let kind = i32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let body = &payload[8..payload.len() - 2];
        let body = match body.iter().position(|b| *b == 0) {
            Some(end) => &body[..end],
            None => body,
        };

        Ok(Self {
            id,
            kind,
            body: String::from_utf8_lossy(body).into_owned(),
        })
    }
}

/// Validates the length prefix of an incoming packet.
pub fn payload_len(prefix: [u8; 4]) -> Result<usize> {
    let size = i32::from_le_bytes(prefix);
    if size < 10 || size as usize > MAX_PACKET_SIZE {
        return Err(Error::Rcon(format!("Invalid packet size: {}", size)));
    }
    Ok(size as usize)
}
