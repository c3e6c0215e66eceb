//! # Utility Modules
//!
//! Supporting utilities for logging, metrics, timing and resource tracking.
//!
//! ## Components
//! - **Logging**: Structured `tracing` subscriber setup
//! - **Metrics**: Thread-safe observability counters
//! - **Time**: Timestamps and the monotonic write clock used for load balancing
//! - **Timeout**: Default deadlines and async timeout wrappers
//! - **Activity**: Counting guard that reports when the last holder releases

pub mod activity;
pub mod logging;
pub mod metrics;
pub mod time;
pub mod timeout;

pub use activity::{ActivityGate, ActivityGuard};
pub use metrics::{Metrics, MetricsSnapshot};
