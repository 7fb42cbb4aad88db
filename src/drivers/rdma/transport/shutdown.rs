use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Connection, ConnectionConfig, TerminateReason};

/// Configuration for shutdown behavior.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for the drain barrier before giving up on it.
    pub timeout: Duration,
}

impl ShutdownConfig {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

impl From<&ConnectionConfig> for ShutdownConfig {
    fn from(config: &ConnectionConfig) -> Self {
        Self::new(config.drain_timeout)
    }
}

/// Result of a shutdown attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownResult {
    /// Every posted work request completed or flushed.
    Drained,
    /// The drain barrier did not complete in time. Resources are still
    /// released once the outstanding references drop.
    TimedOut,
    /// Shutdown was already in progress.
    AlreadyShuttingDown,
}

/// Logout-style teardown.
///
/// 1. Moves the connection to TERMINATING, which errors the queue pair and
///    posts the drain beacon
/// 2. Waits for the beacon's completion
/// 3. Drops the connection manager's reference so the connection can be released
pub(super) async fn graceful_shutdown(
    conn: &Connection,
    config: &ShutdownConfig,
) -> ShutdownResult {
    if conn.logout_posted.swap(true, Ordering::AcqRel) {
        return ShutdownResult::AlreadyShuttingDown;
    }
    debug!(conn = conn.id(), state = %conn.state(), "initiating shutdown");

    conn.terminate(TerminateReason::Logout);
    let result = if conn.wait_drained(config.timeout).await {
        ShutdownResult::Drained
    } else {
        warn!(
            conn = conn.id(),
            timeout = ?config.timeout,
            inflight = conn.inflight_count(),
            "drain barrier not reached"
        );
        ShutdownResult::TimedOut
    };
    conn.put_cm_ref();
    debug!(conn = conn.id(), ?result, "shutdown finished");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_connection() {
        let conn = ConnectionConfig::default().with_drain_timeout(Duration::from_millis(250));
        let cfg = ShutdownConfig::from(&conn);
        assert_eq!(cfg.timeout, Duration::from_millis(250));
        assert_eq!(ShutdownConfig::default().timeout, Duration::from_secs(5));
    }
}
