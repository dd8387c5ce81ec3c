//! Configuration for the RPC client.

use std::time::Duration;

/// Default reply timeout in seconds.
pub const DEFAULT_REPLY_TIMEOUT_SECS: u64 = 30;

/// RPC client configuration.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// How long a call waits for its reply.
    pub reply_timeout: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(DEFAULT_REPLY_TIMEOUT_SECS),
        }
    }
}

impl RpcClientConfig {
    pub fn with_reply_timeout(reply_timeout: Duration) -> Self {
        Self { reply_timeout }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_is_thirty_seconds() {
        assert_eq!(RpcClientConfig::default().reply_timeout, Duration::from_secs(30));
    }
}
