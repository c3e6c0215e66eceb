//! # Routing
//!
//! Relay-side view of the network: who is connected ([`registry`]) and who
//! an envelope should reach ([`router`]).

pub mod registry;
pub mod router;

pub use registry::{ConnectionHandle, ConnectionRegistry, PeerRecord};
pub use router::{resolve, select, RouteError};
