//! Counter store trait for abstracting local and distributed backends.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The admission script failed to execute.
    #[error("admission script failed: {0}")]
    Script(String),

    /// The round trip exceeded the configured timeout.
    #[error("store round trip exceeded {0:?}")]
    Timeout(Duration),

    /// The window cannot be expressed as an expiry by this store.
    #[error("window of {0:?} is out of range")]
    WindowOutOfRange(Duration),

    /// The store answered with something other than a count.
    #[error("invalid store response: {0}")]
    InvalidResponse(String),
}

/// A shared counter backend able to run the admission script atomically.
///
/// Implementations must make the increment, the first-increment expiry and
/// the read one indivisible step per key; the limiter holds no locks of its
/// own.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter at `key` and return the new count.
    ///
    /// An absent or expired key counts from zero. When the increment creates
    /// the window (count becomes 1) the key expires after `window`; later
    /// increments leave the expiry alone. `quota` is passed through for
    /// backends that want it, but the admission decision is made by the caller.
    async fn admit(&self, key: &str, quota: u64, window: Duration) -> Result<u64, StoreError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}
