//! RDMA data-transfer engine for an iSER storage target.
//!
//! The crate maps SCSI command buffers onto chained RDMA work requests,
//! pools fast-registration descriptors, processes completions on per-vector
//! worker threads and drives the connection lifecycle from connection-manager
//! events through the drain barrier to release.
//!
//! Hardware access goes through the [`drivers::rdma::verbs`] traits. The
//! in-tree [`drivers::rdma::soft`] device implements them in software.

pub mod drivers;
pub mod error;
pub mod memory;
pub mod pool;
pub mod transport;

pub use drivers::rdma::cm::{CmDispatcher, CmEvent, CmId, ConnectParams};
pub use drivers::rdma::context::{Device, DeviceCaps};
pub use drivers::rdma::transport::{
    Connection, ConnectionConfig, ConnectionState, DeviceConfig, Direction, ProtectionOp,
    ProtectionRequest, ShutdownConfig, ShutdownResult, TerminateReason, TransferHandle,
    TransferRequest,
};
pub use error::{IserError, IserResult};
pub use memory::{DataBuf, RegistrationPool, RemoteRegion, ScatterEntry};
pub use pool::DevicePool;
pub use transport::{CommandHandler, FailureReason, TransferStatus};
