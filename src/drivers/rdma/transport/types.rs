//! Internal types used by the connection.

use super::command::CommandTransferContext;
use crate::drivers::rdma::verbs::WcStatus;

/// Why a connection is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    /// Peer or network layer disconnected.
    Disconnect,
    /// Orderly logout initiated locally.
    Logout,
    /// A work request failed.
    WorkCompletionError,
    /// The queue pair rejected a post.
    PostFailure,
    /// Login did not complete in time or connection setup failed.
    HandshakeFailure,
    /// The underlying device went away.
    DeviceRemoval,
}

/// A posted command waiting for its signaled completions.
pub(crate) struct InflightCommand {
    pub ctx: CommandTransferContext,
    pub outstanding: usize,
    pub first_error: Option<WcStatus>,
    /// Report the outcome to the command handler.
    pub notify: bool,
    /// Part of the chain never reached the queue pair.
    pub post_failed: bool,
}
