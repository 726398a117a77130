//! Session and evaluation context configuration.

use std::time::Duration;

use sandbox_sdk_transport::RpcConfig;

/// Default bound on waiting for a terminal/process exit after a stop call.
pub const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on waiting for the push notification answering a file get/update.
pub const DEFAULT_FILE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// RPC channel settings.
    pub rpc: RpcConfig,
    /// How long `destroy`/`kill` waits for the exit notification (default: 10s).
    pub exit_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
        }
    }
}

impl SessionConfig {
    /// Set the RPC channel settings.
    #[must_use]
    pub fn with_rpc(mut self, rpc: RpcConfig) -> Self {
        self.rpc = rpc;
        self
    }

    /// Set the exit wait bound.
    #[must_use]
    pub const fn with_exit_timeout(mut self, timeout: Duration) -> Self {
        self.exit_timeout = timeout;
        self
    }
}

/// Configuration for an [`EvaluationContext`](crate::EvaluationContext).
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// How long `get_file`/`update_file` wait for their notification (default: 10s).
    pub file_timeout: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            file_timeout: DEFAULT_FILE_TIMEOUT,
        }
    }
}

impl ContextConfig {
    /// Set the file get/update wait bound.
    #[must_use]
    pub const fn with_file_timeout(mut self, timeout: Duration) -> Self {
        self.file_timeout = timeout;
        self
    }
}
