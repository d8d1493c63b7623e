use serde::Deserialize;

use crate::constants::DEFAULT_CONN_RETRIES;

/// Retry policy for transient connection failures.
///
/// Attempt-bounded only: no backoff and no extra timeout, since the transport
/// owns its own timeouts and every other error kind surfaces immediately.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `ConnectionFailed` only.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_CONN_RETRIES,
        }
    }
}

fn default_max_retries() -> usize {
    DEFAULT_CONN_RETRIES
}
