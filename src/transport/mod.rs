//! Seam between the transfer engine and the iSCSI command layer above it.

pub mod framing;

use std::fmt;

use crate::drivers::rdma::transport::{Connection, ConnectionState};
use crate::drivers::rdma::verbs::{SignatureErrorKind, WcStatus};
use framing::IserPdu;

/// Why a command's data transfer did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The device reported an error completion for one of the command's requests.
    WorkCompletion(WcStatus),
    /// The chain was rejected by the queue pair.
    PostFailed,
    /// The connection went down with the command in flight.
    ConnectionTerminated,
}

/// Outcome of one command's data transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    /// Data moved but a protection check failed at `bad_block`.
    ProtectionError {
        bad_block: u64,
        kind: SignatureErrorKind,
    },
    Failed(FailureReason),
}

impl TransferStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferStatus::Success)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Success => write!(f, "success"),
            TransferStatus::ProtectionError { bad_block, kind } => {
                write!(f, "{:?} check failed at block {}", kind, bad_block)
            }
            TransferStatus::Failed(reason) => write!(f, "failed: {:?}", reason),
        }
    }
}

/// Command-processing collaborator.
///
/// Callbacks run on completion worker threads and must not block. They may
/// call back into the connection, e.g. to submit the next transfer.
pub trait CommandHandler: Send + Sync + 'static {
    /// A command's data transfer finished. Called exactly once per accepted submit.
    fn on_transfer_complete(&self, conn: &Connection, tag: u32, status: TransferStatus);

    /// The connection moved to `state`.
    fn on_connection_state_changed(&self, conn: &Connection, state: ConnectionState) {
        let _ = (conn, state);
    }

    /// A control PDU arrived on the receive queue.
    fn on_pdu_received(&self, conn: &Connection, pdu: IserPdu) {
        let _ = (conn, pdu);
    }
}
