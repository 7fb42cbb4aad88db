use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::drivers::rdma::context::Device;
use crate::drivers::rdma::transport::DeviceConfig;
use crate::drivers::rdma::verbs::VerbsDevice;
use crate::error::IserResult;

/// Opened devices shared by every connection accepted on them.
///
/// Keyed by device name and reference counted by connection: the first
/// connection on a device opens it, the last release drops it from the pool.
pub struct DevicePool {
    config: DeviceConfig,
    devices: Mutex<FxHashMap<String, (Arc<Device>, usize)>>,
}

impl DevicePool {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            devices: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Look up the opened device for `verbs`, opening it on first use.
    /// Every successful call must be paired with [`Self::release`].
    pub fn get_or_open(&self, verbs: &Arc<dyn VerbsDevice>) -> IserResult<Arc<Device>> {
        let mut devices = self.devices.lock();
        if let Some((device, refs)) = devices.get_mut(verbs.name()) {
            *refs += 1;
            return Ok(device.clone());
        }
        let device = Device::open(verbs.clone(), &self.config)?;
        devices.insert(verbs.name().to_string(), (device.clone(), 1));
        Ok(device)
    }

    /// Drop one reference. Returns true when this closed the device.
    pub fn release(&self, name: &str) -> bool {
        let closed = {
            let mut devices = self.devices.lock();
            let Some((_, refs)) = devices.get_mut(name) else {
                debug!(device = name, "release of unknown device");
                return false;
            };
            *refs -= 1;
            if *refs > 0 {
                return false;
            }
            devices.remove(name)
        };
        // Dropped outside the lock; closing joins completion workers.
        if closed.is_some() {
            info!(device = name, "last connection gone, device closed");
        }
        drop(closed);
        true
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn refcount(&self, name: &str) -> usize {
        self.devices.lock().get(name).map_or(0, |(_, refs)| *refs)
    }
}
