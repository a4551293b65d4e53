//! Worker configuration.

use std::time::Duration;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Heartbeat interval. Must be well below the manager's heartbeat timeout.
    pub heartbeat_interval: Duration,

    /// How often a busy worker looks for cancellation and shutdown messages.
    pub cancel_poll_interval: Duration,

    /// Grace period for the current unit when the manager's shutdown
    /// message does not carry one.
    pub shutdown_grace: Duration,

    /// How long an interrupted unit may take to stop before it is abandoned.
    pub interrupt_timeout: Duration,

    /// Reported to the manager in the hello message.
    pub hostname: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            cancel_poll_interval: Duration::from_millis(250),
            shutdown_grace: Duration::from_secs(30),
            interrupt_timeout: Duration::from_secs(10),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
        }
    }
}
