//! # Error Types
//!
//! Error handling for the relay protocol.
//!
//! This module defines every error variant that can surface from the relay
//! runtime, from low-level transport failures to routing outcomes that are
//! reported back to the sending peer.
//!
//! ## Error Categories
//! - **Transport**: I/O failures, malformed frame headers, oversized frames
//! - **Protocol**: version mismatch, authentication failure, unknown packet tags
//! - **Routing**: no target found, self-reference rejected
//! - **Conversation**: timeouts, remote-side errors, expired queued sends
//! - **Dispatch**: handler failures routed to the error hook
//!
//! Only authentication failures and unrecoverable transport errors close a
//! connection. Everything else is handled per frame or per handler.
//!
//! ## Example Usage
//! ```rust
//! use peer_relay::error::{ProtocolError, Result};
//!
//! fn require_group(group: &str) -> Result<()> {
//!     if group.is_empty() {
//!         return Err(ProtocolError::AuthenticationFailure("group is empty".into()));
//!     }
//!     Ok(())
//! }
//!
//! assert!(require_group("").is_err());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Handshake errors
    pub const ERR_EMPTY_UNIQUE_ID: &str = "Unique id must not be empty";
    pub const ERR_EMPTY_GROUP: &str = "Group must not be empty";
    pub const ERR_EMPTY_TOKEN: &str = "Authentication token must not be empty";
    pub const ERR_INVALID_TOKEN: &str = "Invalid authentication token";
    pub const ERR_DUPLICATE_PEER: &str = "A peer with this unique id is already connected";
    pub const ERR_HANDSHAKE_CLOSED: &str = "Connection closed before handshake completed";

    /// Connection errors
    pub const ERR_NOT_CONNECTED: &str = "Not connected to relay";
    pub const ERR_NO_RUNTIME: &str = "Conversation timers require a Tokio runtime";

    /// Routing errors
    pub const ERR_NO_TARGET: &str = "No peer matched the routing target";
    pub const ERR_SELF_REFERENCE: &str = "Peers may not address themselves";
}

/// ProtocolError is the primary error type for all relay operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Unknown packet type: {0}")]
    UnknownPacketType(String),

    #[error("Invalid protocol header")]
    InvalidHeader,

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: i32, actual: i32 },

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected to relay")]
    NotConnected,

    #[error("No target found: {0}")]
    NoTargetFound(String),

    #[error("Self reference rejected: {0}")]
    SelfReferenceRejected(String),

    #[error("Handler {handler} failed: {message}")]
    HandlerFailure { handler: String, message: String },

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Queued message expired before delivery")]
    QueueExpired,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Unexpected message type")]
    UnexpectedMessage,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
