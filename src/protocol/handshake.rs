//! Connect-time authentication exchange.
//!
//! Every connection starts in [`HandshakeState::AwaitingHandshake`]. The
//! client sends a [`HandshakeRequest`] right after connecting; the relay
//! validates it with an [`Authenticator`] and answers with a
//! [`HandshakeResult`]. Success moves both ends to `Authenticated` and
//! removes the handshake stage from the frame codec. Failure moves them to
//! `Rejected`: the relay sends the result and closes the connection, the
//! client treats the rejection as fatal.
//!
//! Handshake state is per connection. Nothing here is global.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{constants, ProtocolError, Result};
use crate::routing::registry::ConnectionRegistry;

/// Sent by a peer immediately after connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub auth_token: String,
    pub unique_id: String,
    pub group: String,
}

impl HandshakeRequest {
    pub fn new(
        auth_token: impl Into<String>,
        unique_id: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            auth_token: auth_token.into(),
            unique_id: unique_id.into(),
            group: group.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ProtocolError::SerializeError(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
    }
}

/// The relay's answer to a [`HandshakeRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResult {
    pub success: bool,
    pub error_message: String,
}

impl HandshakeResult {
    pub fn accepted() -> Self {
        Self {
            success: true,
            error_message: String::new(),
        }
    }

    pub fn rejected(error_message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: error_message.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ProtocolError::SerializeError(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
    }

    /// Convert into the client-side outcome
    pub fn into_result(self) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(ProtocolError::AuthenticationFailure(self.error_message))
        }
    }
}

/// Per-connection authentication state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    AwaitingHandshake,
    Authenticated,
    Rejected(String),
}

impl HandshakeState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, HandshakeState::Authenticated)
    }

    /// Only authenticated connections may carry ordinary envelopes
    pub fn admits_envelopes(&self) -> bool {
        self.is_authenticated()
    }

    /// Whether a handshake has been accepted or rejected
    pub fn is_finished(&self) -> bool {
        *self != HandshakeState::AwaitingHandshake
    }

    /// Apply a handshake outcome. Only the awaiting state can transition.
    pub fn complete<T>(&mut self, outcome: &Result<T>) -> Result<()> {
        if *self != HandshakeState::AwaitingHandshake {
            return Err(ProtocolError::UnexpectedMessage);
        }
        *self = match outcome {
            Ok(_) => HandshakeState::Authenticated,
            Err(e) => HandshakeState::Rejected(e.to_string()),
        };
        Ok(())
    }
}

/// Relay-side validation of handshake requests
#[derive(Debug, Clone)]
pub struct Authenticator {
    token: String,
}

impl Authenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Check a request against the shared token and the current registry.
    ///
    /// The duplicate check here is advisory; the registry re-checks
    /// atomically when the peer is actually added.
    pub fn validate(
        &self,
        request: &HandshakeRequest,
        registry: &ConnectionRegistry,
    ) -> Result<()> {
        if request.auth_token.is_empty() {
            return Err(reject(constants::ERR_EMPTY_TOKEN));
        }
        if request.unique_id.is_empty() {
            return Err(reject(constants::ERR_EMPTY_UNIQUE_ID));
        }
        if request.group.is_empty() {
            return Err(reject(constants::ERR_EMPTY_GROUP));
        }
        if !constant_time_eq(request.auth_token.as_bytes(), self.token.as_bytes()) {
            warn!(peer = %request.unique_id, "Handshake presented an invalid token");
            return Err(reject(constants::ERR_INVALID_TOKEN));
        }
        if registry.exists(&request.unique_id) {
            return Err(reject(constants::ERR_DUPLICATE_PEER));
        }

        debug!(peer = %request.unique_id, group = %request.group, "Handshake request valid");
        Ok(())
    }
}

fn reject(message: &str) -> ProtocolError {
    ProtocolError::AuthenticationFailure(message.to_string())
}

/// Token comparison without a data-dependent early exit; lengths are not hidden.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
