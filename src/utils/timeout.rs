//! Default deadlines and a small async timeout wrapper.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Default timeout for connect and handshake steps
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for a registered conversation
pub const DEFAULT_CONVERSATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed for connections to drain during shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a future with a deadline, mapping expiry to `ProtocolError::Timeout`.
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
