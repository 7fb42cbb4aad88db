//! Connection and device configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::protocol::{DEFAULT_QUEUE_DEPTH, DEFAULT_RECV_DEPTH, ISCSI_ISER_SG_TABLESIZE, ISERT_MAX_CQ};
use crate::transport::framing::DEFAULT_RECV_DATA_LEN;

/// Per-connection sizing and handshake timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Maximum commands in flight. Also sizes the registration pool.
    pub queue_depth: usize,
    /// Receive descriptors kept posted.
    pub recv_depth: usize,
    /// Inline data bytes per receive descriptor.
    pub recv_data_len: usize,
    /// Negotiate protection offload when the device supports it.
    pub pi_enabled: bool,
    #[serde(with = "duration_ms")]
    pub login_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub drain_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            recv_depth: DEFAULT_RECV_DEPTH,
            recv_data_len: DEFAULT_RECV_DATA_LEN,
            pi_enabled: false,
            login_timeout: Duration::from_secs(15),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    /// Create a new configuration with default values.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_queue_depth(mut self, n: usize) -> Self {
        self.queue_depth = n;
        self
    }

    #[inline]
    pub fn with_recv_depth(mut self, n: usize) -> Self {
        self.recv_depth = n;
        self
    }

    #[inline]
    pub fn with_recv_data_len(mut self, n: usize) -> Self {
        self.recv_data_len = n;
        self
    }

    #[inline]
    pub fn with_pi_enabled(mut self, enabled: bool) -> Self {
        self.pi_enabled = enabled;
        self
    }

    #[inline]
    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    #[inline]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

/// Device-wide resource limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Upper bound on completion processors, further capped by vectors and CPUs.
    pub max_completion_queues: usize,
    /// Entries per completion queue.
    pub cq_entries: usize,
    /// Largest scatter list one registration may cover.
    pub max_sg_table_size: usize,
    /// Completions reaped per poll.
    pub completion_batch: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_completion_queues: ISERT_MAX_CQ,
            cq_entries: 4096,
            max_sg_table_size: ISCSI_ISER_SG_TABLESIZE,
            completion_batch: 16,
        }
    }
}

impl DeviceConfig {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_max_completion_queues(mut self, n: usize) -> Self {
        self.max_completion_queues = n.clamp(1, ISERT_MAX_CQ);
        self
    }

    #[inline]
    pub fn with_cq_entries(mut self, n: usize) -> Self {
        self.cq_entries = n;
        self
    }

    #[inline]
    pub fn with_max_sg_table_size(mut self, n: usize) -> Self {
        self.max_sg_table_size = n;
        self
    }

    #[inline]
    pub fn with_completion_batch(mut self, n: usize) -> Self {
        self.completion_batch = n.max(1);
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
