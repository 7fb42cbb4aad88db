//! Connection manager event dispatch.
//!
//! Address resolution and the CM wire protocol live outside this crate. The
//! network layer turns CM activity into [`CmEvent`]s and hands them to a
//! [`CmDispatcher`], usually over a channel drained by a background thread.

use flume::Receiver;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::drivers::rdma::transport::{Connection, ConnectionConfig, TerminateReason};
use crate::drivers::rdma::verbs::VerbsDevice;
use crate::error::{IserError, IserResult};
use crate::pool::DevicePool;
use crate::transport::CommandHandler;

/// Connection manager identifier of one connection.
pub type CmId = u64;

/// Parameters the initiator proposed in its connect request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectParams {
    /// Commands the initiator intends to keep outstanding.
    pub queue_depth: Option<usize>,
}

pub enum CmEvent {
    ConnectRequest {
        cm_id: CmId,
        device: Arc<dyn VerbsDevice>,
        params: ConnectParams,
    },
    Established { cm_id: CmId },
    Disconnected { cm_id: CmId },
    DeviceRemoval { cm_id: CmId },
    TimewaitExit { cm_id: CmId },
    Rejected { cm_id: CmId },
    ConnectError { cm_id: CmId },
    Unreachable { cm_id: CmId },
}

impl CmEvent {
    pub fn cm_id(&self) -> CmId {
        match self {
            CmEvent::ConnectRequest { cm_id, .. }
            | CmEvent::Established { cm_id }
            | CmEvent::Disconnected { cm_id }
            | CmEvent::DeviceRemoval { cm_id }
            | CmEvent::TimewaitExit { cm_id }
            | CmEvent::Rejected { cm_id }
            | CmEvent::ConnectError { cm_id }
            | CmEvent::Unreachable { cm_id } => *cm_id,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            CmEvent::ConnectRequest { .. } => "ConnectRequest",
            CmEvent::Established { .. } => "Established",
            CmEvent::Disconnected { .. } => "Disconnected",
            CmEvent::DeviceRemoval { .. } => "DeviceRemoval",
            CmEvent::TimewaitExit { .. } => "TimewaitExit",
            CmEvent::Rejected { .. } => "Rejected",
            CmEvent::ConnectError { .. } => "ConnectError",
            CmEvent::Unreachable { .. } => "Unreachable",
        }
    }
}

impl std::fmt::Debug for CmEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CmEvent::ConnectRequest { cm_id, device, params } => f
                .debug_struct("ConnectRequest")
                .field("cm_id", cm_id)
                .field("device", &device.name())
                .field("params", params)
                .finish(),
            other => f
                .debug_struct(other.name())
                .field("cm_id", &other.cm_id())
                .finish(),
        }
    }
}

type ConnectionTable = Arc<Mutex<FxHashMap<CmId, Arc<Connection>>>>;

/// Routes connection manager events to connections.
///
/// Connections are created on `ConnectRequest` and leave the table when their
/// resources are released. The table lock is never held while calling into a
/// connection.
pub struct CmDispatcher {
    devices: Arc<DevicePool>,
    connections: ConnectionTable,
    config: ConnectionConfig,
    handler: Arc<dyn CommandHandler>,
}

impl CmDispatcher {
    pub fn new(
        devices: Arc<DevicePool>,
        config: ConnectionConfig,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        Self {
            devices,
            connections: Arc::new(Mutex::new(FxHashMap::default())),
            config,
            handler,
        }
    }

    pub fn devices(&self) -> &Arc<DevicePool> {
        &self.devices
    }

    pub fn connection(&self, cm_id: CmId) -> Option<Arc<Connection>> {
        self.connections.lock().get(&cm_id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn handle_event(&self, event: CmEvent) -> IserResult<()> {
        debug!(?event, "cm event");
        let cm_id = event.cm_id();
        if let CmEvent::ConnectRequest { device, params, .. } = event {
            return self.connect_request(cm_id, device, params).map(|_| ());
        }

        let Some(conn) = self.connection(cm_id) else {
            warn!(cm_id, event = event.name(), "event for unknown connection");
            return Ok(());
        };
        match event {
            CmEvent::ConnectRequest { .. } => {}
            CmEvent::Established { .. } => conn.on_established()?,
            CmEvent::Disconnected { .. } => conn.terminate(TerminateReason::Disconnect),
            CmEvent::DeviceRemoval { .. } => {
                conn.terminate(TerminateReason::DeviceRemoval);
                conn.put_cm_ref();
            }
            CmEvent::TimewaitExit { .. } => {
                conn.terminate(TerminateReason::Disconnect);
                conn.put_cm_ref();
            }
            CmEvent::Rejected { .. } | CmEvent::ConnectError { .. } | CmEvent::Unreachable { .. } => {
                conn.terminate(TerminateReason::HandshakeFailure);
                conn.put_cm_ref();
            }
        }
        Ok(())
    }

    fn connect_request(
        &self,
        cm_id: CmId,
        verbs: Arc<dyn VerbsDevice>,
        params: ConnectParams,
    ) -> IserResult<Arc<Connection>> {
        if self.connections.lock().contains_key(&cm_id) {
            return Err(IserError::InvalidInput(format!(
                "duplicate connect request for cm_id {}",
                cm_id
            )));
        }
        let device = self.devices.get_or_open(&verbs)?;
        let depth = params
            .queue_depth
            .map_or(self.config.queue_depth, |d| d.min(self.config.queue_depth))
            .max(1);
        let config = self.config.clone().with_queue_depth(depth);

        let conn = match Connection::accept(&device, cm_id, config, self.handler.clone()) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(cm_id, device = device.name(), "rejecting connect request: {}", e);
                self.devices.release(device.name());
                return Err(e);
            }
        };

        let table = Arc::downgrade(&self.connections);
        let devices = Arc::downgrade(&self.devices);
        let name = device.name().to_string();
        conn.add_release_hook(move || {
            if let Some(table) = table.upgrade() {
                table.lock().remove(&cm_id);
            }
            if let Some(devices) = devices.upgrade() {
                devices.release(&name);
            }
        });
        self.connections.lock().insert(cm_id, conn.clone());
        info!(cm_id, conn = conn.id(), queue_depth = depth, "connect request accepted");
        Ok(conn)
    }

    /// Drain `events` on a background thread until every sender is dropped.
    pub fn spawn(self: Arc<Self>, events: Receiver<CmEvent>) -> IserResult<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("iser-cm".to_string())
            .spawn(move || {
                while let Ok(event) = events.recv() {
                    let cm_id = event.cm_id();
                    let name = event.name();
                    if let Err(e) = self.handle_event(event) {
                        error!(cm_id, event = name, "cm event failed: {}", e);
                    }
                }
                debug!("cm event channel closed");
            })
            .map_err(IserError::Io)
    }
}
