//! # Protocol Layer
//!
//! Message-level semantics on top of the framed transport.
//!
//! ## Components
//! - **Envelope**: routed unit carrying a packet plus routing metadata
//! - **Handshake**: one-time token authentication per connection
//! - **Conversation**: request/response correlation with timeouts
//! - **Dispatcher**: decode, conversation lookup and handler chain
//! - **Procedure**: typed request → response handlers

pub mod conversation;
pub mod dispatcher;
pub mod envelope;
pub mod handshake;
pub mod procedure;

pub use conversation::{
    Claim, Conversation, ConversationHandle, ConversationManager, ConversationOptions,
    ResponseMode,
};
pub use dispatcher::{
    DispatchOutcome, Dispatcher, HandlerFailure, MessageContext, MessageHandler, ReplySender,
};
pub use envelope::{ConversationId, Envelope, ErrorKind, ErrorPacket, TargetType};
pub use handshake::{Authenticator, HandshakeRequest, HandshakeResult, HandshakeState};
pub use procedure::{Caller, ProcedureMode, Procedures};
