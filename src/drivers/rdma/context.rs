use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::poller::CompletionProcessor;
use super::transport::{Connection, ConnectionId, DeviceConfig};
use super::verbs::{DeviceAttributes, TransportKind, VerbsDevice};
use crate::error::{IserError, IserResult};

/// Limits the transfer engine sizes work requests and registrations from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    /// Scatter entries per send or RDMA write.
    pub max_send_sge: usize,
    /// Scatter entries per RDMA read.
    pub max_read_sge: usize,
    /// Pages one fast registration can map.
    pub max_registration_pages: usize,
    /// Device can offload protection information.
    pub protection_capable: bool,
    /// RDMA read sinks must be registered (iWARP).
    pub requires_read_registration: bool,
    pub local_dma_lkey: u32,
}

impl DeviceCaps {
    pub fn from_attributes(attr: &DeviceAttributes, config: &DeviceConfig) -> Self {
        Self {
            max_send_sge: attr.max_sge,
            max_read_sge: attr.max_sge_rd.min(attr.max_sge),
            max_registration_pages: attr
                .max_fast_reg_page_list_len
                .min(config.max_sg_table_size),
            protection_capable: attr.signature_handover,
            requires_read_registration: attr.transport == TransportKind::Iwarp,
            local_dma_lkey: attr.local_dma_lkey,
        }
    }
}

/// An opened RDMA device shared by the connections accepted on it.
///
/// Owns the completion processors and the registry of live connections. The
/// registry lock is independent of any per-connection lock.
pub struct Device {
    verbs: Arc<dyn VerbsDevice>,
    caps: DeviceCaps,
    config: DeviceConfig,
    processors: Vec<CompletionProcessor>,
    next_processor: AtomicUsize,
    next_conn_id: AtomicU64,
    connections: Mutex<FxHashMap<ConnectionId, Arc<Connection>>>,
}

impl Device {
    pub fn open(verbs: Arc<dyn VerbsDevice>, config: &DeviceConfig) -> IserResult<Arc<Self>> {
        let attr = verbs.query_attributes();
        let caps = DeviceCaps::from_attributes(&attr, config);
        if caps.max_send_sge == 0 || caps.max_read_sge == 0 {
            return Err(IserError::Verbs(format!(
                "{} reports no scatter entries per work request",
                verbs.name()
            )));
        }

        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let count = config
            .max_completion_queues
            .min(attr.num_comp_vectors)
            .min(cpus)
            .max(1);
        let cq_entries = config.cq_entries.min(attr.max_cqe);

        let mut processors = Vec::with_capacity(count);
        for index in 0..count {
            processors.push(CompletionProcessor::start(
                index,
                verbs.clone(),
                cq_entries,
                config.completion_batch,
            )?);
        }

        info!(
            device = verbs.name(),
            processors = count,
            max_send_sge = caps.max_send_sge,
            max_read_sge = caps.max_read_sge,
            max_registration_pages = caps.max_registration_pages,
            protection_capable = caps.protection_capable,
            "device opened"
        );

        Ok(Arc::new(Self {
            verbs,
            caps,
            config: config.clone(),
            processors,
            next_processor: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(FxHashMap::default()),
        }))
    }

    pub fn name(&self) -> &str {
        self.verbs.name()
    }

    pub fn verbs(&self) -> &Arc<dyn VerbsDevice> {
        &self.verbs
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    pub fn processor(&self, index: usize) -> &CompletionProcessor {
        &self.processors[index]
    }

    /// Attached queue pairs per processor.
    pub fn active_qps(&self) -> Vec<usize> {
        self.processors.iter().map(|p| p.active_qps()).collect()
    }

    /// Pick the processor for a new queue pair, round-robin.
    pub(crate) fn assign_processor(&self) -> usize {
        let index = self.next_processor.fetch_add(1, Ordering::Relaxed) % self.processors.len();
        debug!(device = self.name(), index, "assigned completion processor");
        index
    }

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, conn: Arc<Connection>) {
        self.connections.lock().insert(conn.id(), conn);
    }

    pub(crate) fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().remove(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().values().cloned().collect()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        debug!(device = self.verbs.name(), "closing device");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::rdma::soft::SoftDevice;

    #[test]
    fn test_caps_from_attributes() {
        let attr = DeviceAttributes {
            max_sge: 30,
            max_sge_rd: 32,
            max_fast_reg_page_list_len: 511,
            signature_handover: true,
            transport: TransportKind::Iwarp,
            ..Default::default()
        };
        let caps = DeviceCaps::from_attributes(&attr, &DeviceConfig::default());
        assert_eq!(caps.max_send_sge, 30);
        assert_eq!(caps.max_read_sge, 30);
        assert_eq!(caps.max_registration_pages, 256);
        assert!(caps.protection_capable);
        assert!(caps.requires_read_registration);

        let ib = DeviceAttributes::default();
        let caps = DeviceCaps::from_attributes(&ib, &DeviceConfig::new().with_max_sg_table_size(1024));
        assert_eq!(caps.max_registration_pages, 512);
        assert!(!caps.requires_read_registration);
    }

    #[test]
    fn test_processor_count_and_round_robin() {
        let verbs = SoftDevice::new(
            "soft0",
            DeviceAttributes {
                num_comp_vectors: 2,
                ..Default::default()
            },
        );
        let dev = Device::open(verbs, &DeviceConfig::default()).unwrap();
        let n = dev.processor_count();
        assert!(n >= 1 && n <= 2);

        let picks: Vec<_> = (0..4).map(|_| dev.assign_processor()).collect();
        for (i, p) in picks.iter().enumerate() {
            assert_eq!(*p, i % n);
        }
    }

    #[test]
    fn test_config_caps_processors() {
        let verbs = SoftDevice::new(
            "soft0",
            DeviceAttributes {
                num_comp_vectors: 32,
                ..Default::default()
            },
        );
        let dev = Device::open(verbs, &DeviceConfig::new().with_max_completion_queues(1)).unwrap();
        assert_eq!(dev.processor_count(), 1);
        assert_eq!(dev.active_qps(), vec![0]);
    }
}
