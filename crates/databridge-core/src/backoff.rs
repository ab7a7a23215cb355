//! Bounded exponential retry for transient I/O

use crate::error::BridgeResult;
use std::future::Future;
use std::time::Duration;
use tracing::error;

/// Retry schedule: `attempts` tries, sleeping `initial`, then doubling
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub attempts: u32,
    pub initial: Duration,
}

impl Backoff {
    /// Store lookups: three attempts, starting at two seconds
    pub const LOOKUP: Backoff = Backoff {
        attempts: 3,
        initial: Duration::from_secs(2),
    };

    /// Bulk writes inside a worker: three attempts, starting at one second
    pub const BULK_SAVE: Backoff = Backoff {
        attempts: 3,
        initial: Duration::from_secs(1),
    };

    /// Credential extraction: three attempts, starting at one second
    pub const CREDENTIALS: Backoff = Backoff {
        attempts: 3,
        initial: Duration::from_secs(1),
    };

    /// Delay slept after the `attempt`-th failure (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Run `op` until it succeeds or the attempts are exhausted
    ///
    /// The last error is returned unchanged; every failure is logged with
    /// the `exceptions` message id.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> BridgeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BridgeResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    error!(
                        message_id = "exceptions",
                        operation = what,
                        attempt = attempt + 1,
                        error = %e,
                        "Operation failed"
                    );
                    if attempt + 1 >= self.attempts.max(1) {
                        return Err(e);
                    }
                    tokio::time::sleep(self.delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}
