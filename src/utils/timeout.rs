//! Timeout defaults and async timeout wrappers.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default time allowed for the WebSocket upgrade to complete.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on how long `close()` waits for the I/O thread to say goodbye.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a fallible future, mapping an elapsed deadline to [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
