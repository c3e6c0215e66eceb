//! # peer-relay
//!
//! Authenticated peer-to-peer messaging through a central relay.
//!
//! Peers open one TCP connection to a relay, authenticate once with a shared
//! token, and then exchange typed packets wrapped in envelopes. The relay
//! forwards each envelope according to its routing directive: to one peer by
//! id, to every member of a group, to the least recently used member of a
//! group, to everyone, or to the relay itself. Request/response flows are
//! correlated by conversation id with per-conversation timeouts.
//!
//! ## Layers
//! - [`core`]: frame codec and tagged packet encoding
//! - [`protocol`]: envelopes, handshake, conversations, dispatch
//! - [`routing`]: connection registry and target resolution
//! - [`service`]: relay and client processes
//! - [`transport`]: TCP plumbing
//! - [`utils`]: logging, metrics and timing helpers
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use serde::{Deserialize, Serialize};
//! use peer_relay::config::NetworkConfig;
//! use peer_relay::core::packet::{PacketRegistry, PacketType};
//! use peer_relay::protocol::{Dispatcher, TargetType};
//! use peer_relay::service::Client;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Ping(u64);
//! impl PacketType for Ping { const TAG: &'static str = "demo.ping"; }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Pong(u64);
//! impl PacketType for Pong { const TAG: &'static str = "demo.pong"; }
//!
//! # async fn run() -> peer_relay::Result<()> {
//! let config = NetworkConfig::from_env()?;
//! let packets = PacketRegistry::builder().register::<Ping>().register::<Pong>().build();
//! let client = Client::connect(
//!     config.client,
//!     config.transport,
//!     Arc::new(Dispatcher::new(packets)),
//! )
//! .await?;
//!
//! let pong: Pong = client
//!     .call(TargetType::LoadBalanced, "echo", &Ping(1), Duration::from_secs(2))
//!     .await?;
//! # let _ = pong;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod routing;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::{ClientConfig, NetworkConfig, RelayConfig, TransportConfig};
pub use error::{ProtocolError, Result};
