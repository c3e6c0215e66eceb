//! # Services
//!
//! The two processes of a relay network.
//!
//! ## Components
//! - **Relay**: accepts peers, authenticates them and forwards envelopes
//! - **Client**: a peer's authenticated connection to the relay
//! - **Outbox**: expiring queue for sends made while disconnected

pub mod client;
pub mod outbox;
pub mod relay;

pub use client::Client;
pub use outbox::Outbox;
pub use relay::Relay;
