//! # Core Protocol Components
//!
//! Framing and payload encoding shared by the relay and its peers.
//!
//! ## Components
//! - **Codec**: Tokio codec that frames envelopes on a byte stream and gates
//!   the one-time handshake stage
//! - **Packet**: tagged payload encoding and the tag → type registry
//!
//! ## Wire Format
//! ```text
//! before authentication: [Kind(i32)] [Version(i32)] [Length(i32)] [Payload(N)]
//! after authentication:              [Version(i32)] [Length(i32)] [Payload(N)]
//! ```
//! All integers are big-endian.
//!
//! ## Limits
//! - Maximum payload size is configurable, 16MB by default
//! - Length is validated before any allocation

pub mod codec;
pub mod packet;
