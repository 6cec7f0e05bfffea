//! udpeer wire protocol: message types and protocol timing constants.

use std::time::Duration;

/// Largest datagram any peer sends or expects to receive.
pub const MAX_DATAGRAM_LEN: usize = 1024;

/// Period of the heartbeat broadcast (and of the registry sweep).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A device whose last heartbeat is older than this is dropped from the registry.
pub const DEVICE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a sender waits for a reply after each send attempt.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Heartbeats go to the limited broadcast address on the service's own port.
pub const BROADCAST_ADDR: std::net::Ipv4Addr = std::net::Ipv4Addr::BROADCAST;

/// Reason text carried by the NACK sent when the END fingerprint does not match.
pub const HASH_MISMATCH: &str = "hash mismatch";

/// All wire message types. Encoding is a flat, space-separated text line (see wire module).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Liveness beacon, broadcast every [`HEARTBEAT_INTERVAL`].
    Heartbeat { name: String },
    /// Short text message; `text` may contain spaces.
    Talk { id: String, text: String },
    /// Opens a file transfer.
    File {
        id: String,
        file_name: String,
        size: u64,
    },
    /// One block of file content. `data` is raw; the codec base64-encodes it.
    Chunk { id: String, seq: u32, data: Vec<u8> },
    /// Closes a transfer with the fingerprint of the whole file.
    End { id: String, fingerprint: String },
    /// Positive acknowledgment for any request carrying `id`.
    Ack { id: String },
    /// Negative acknowledgment; terminal for the transfer.
    Nack { id: String, reason: String },
}

impl Message {
    /// Wire keyword for this message.
    pub fn keyword(&self) -> &'static str {
        match self {
            Message::Heartbeat { .. } => "HEARTBEAT",
            Message::Talk { .. } => "TALK",
            Message::File { .. } => "FILE",
            Message::Chunk { .. } => "CHUNK",
            Message::End { .. } => "END",
            Message::Ack { .. } => "ACK",
            Message::Nack { .. } => "NACK",
        }
    }

    /// Correlation id, if the message carries one (all but HEARTBEAT do).
    pub fn id(&self) -> Option<&str> {
        match self {
            Message::Heartbeat { .. } => None,
            Message::Talk { id, .. }
            | Message::File { id, .. }
            | Message::Chunk { id, .. }
            | Message::End { id, .. }
            | Message::Ack { id }
            | Message::Nack { id, .. } => Some(id),
        }
    }

    pub fn ack(id: impl Into<String>) -> Self {
        Message::Ack { id: id.into() }
    }

    pub fn nack(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Message::Nack {
            id: id.into(),
            reason: reason.into(),
        }
    }
}
