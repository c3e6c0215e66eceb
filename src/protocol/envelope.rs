//! Routed unit of communication.
//!
//! An [`Envelope`] carries an encoded packet plus the routing metadata the
//! relay needs to pick destinations. Envelopes are created per send and
//! consumed once; they are never persisted.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::packet::{self, Packet, PacketType};
use crate::error::{ProtocolError, Result};

/// How the relay computes an envelope's destination set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetType {
    /// `target` is an exact peer id
    Direct,
    /// `target` is a group name; every member receives a copy
    Type,
    /// `target` is a group name; exactly one member receives it
    LoadBalanced,
    /// Every connected peer receives a copy; `target` is ignored
    Broadcast,
    /// Terminates at the relay itself
    Server,
}

/// Correlation id linking requests and responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub u64);

impl ConversationId {
    /// Random id; uniqueness among live conversations is enforced by the manager
    pub fn random() -> Self {
        ConversationId(rand::random::<u64>())
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Wire message routed by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: String,
    pub target: String,
    pub target_type: TargetType,
    pub conversation_id: ConversationId,
    /// Packet encoded with [`packet::serialize`]
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Build an envelope around an encoded packet
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        target_type: TargetType,
        conversation_id: ConversationId,
        packet: &dyn Packet,
    ) -> Result<Self> {
        Ok(Self {
            source: source.into(),
            target: target.into(),
            target_type,
            conversation_id,
            payload: packet::serialize(packet)?,
        })
    }

    /// Error envelope sent back to `recipient` on the same conversation
    pub fn error_reply(
        source: impl Into<String>,
        recipient: impl Into<String>,
        conversation_id: ConversationId,
        error: &ErrorPacket,
    ) -> Result<Self> {
        Self::new(source, recipient, TargetType::Direct, conversation_id, error)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ProtocolError::SerializeError(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
    }
}

/// Category of an [`ErrorPacket`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The routing directive matched no connected peer
    NoTargetFound,
    /// The sender addressed itself while self-forwarding is disabled
    SelfReferenceRejected,
    /// A queued send expired before the connection came back
    QueueExpired,
    /// A queued send was dropped because the client stopped for good
    NotConnected,
    /// The remote handler failed
    Remote,
}

/// Error carried back to a caller through its conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPacket {
    pub kind: ErrorKind,
    pub message: String,
}

impl PacketType for ErrorPacket {
    const TAG: &'static str = "relay.error";
}

impl ErrorPacket {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Remote, message)
    }
}

impl From<&ErrorPacket> for ProtocolError {
    fn from(packet: &ErrorPacket) -> Self {
        match packet.kind {
            ErrorKind::NoTargetFound => ProtocolError::NoTargetFound(packet.message.clone()),
            ErrorKind::SelfReferenceRejected => {
                ProtocolError::SelfReferenceRejected(packet.message.clone())
            }
            ErrorKind::QueueExpired => ProtocolError::QueueExpired,
            ErrorKind::NotConnected => ProtocolError::NotConnected,
            ErrorKind::Remote => ProtocolError::Remote(packet.message.clone()),
        }
    }
}
