//! Manager configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How often the run registry is consulted for new runs and stop requests.
    pub poll_interval: Duration,

    /// Upper bound on how long one iteration waits for worker messages.
    pub recv_timeout: Duration,

    /// Silence after which a worker is presumed dead.
    pub heartbeat_timeout: Duration,

    /// Upper bound on any single registry or definition-store call.
    pub registry_timeout: Duration,

    /// Minimum delay between two deliveries of the same cancellation to a worker.
    pub cancel_resend_interval: Duration,

    /// Grace period announced to workers on shutdown.
    pub shutdown_grace: Duration,

    /// Extra time, past the grace period, spent collecting the reports of
    /// workers that were busy at shutdown.
    pub shutdown_margin: Duration,

    /// Where to write a Prometheus textfile snapshot after each registry poll.
    pub metrics_path: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            recv_timeout: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_secs(45),
            registry_timeout: Duration::from_secs(5),
            cancel_resend_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
            shutdown_margin: Duration::from_secs(15),
            metrics_path: None,
        }
    }
}
