//! iSER transport error types.

use std::io;
use thiserror::Error;

use crate::drivers::rdma::transport::ConnectionState;
use crate::drivers::rdma::verbs::WcStatus;

/// Result type for transport operations
pub type IserResult<T> = Result<T, IserError>;

/// iSER transport error types
#[derive(Debug, Error)]
pub enum IserError {
    /// No free registration descriptor. Transient, the caller may retry.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Scatter list exceeds what one registration can cover
    #[error("Buffer too large: {entries} DMA entries, registration limit {max}")]
    BufferTooLarge {
        /// DMA entries after coalescing
        entries: usize,
        /// Device page-list limit
        max: usize,
    },

    /// Hardware reported a failed operation
    #[error("Work completion error: wr_id={wr_id:#x}, status={status:?}")]
    WorkCompletion {
        /// Work request id
        wr_id: u64,
        /// Completion status
        status: WcStatus,
    },

    /// Operation not permitted in the current connection state
    #[error("{operation} rejected in connection state {state}")]
    ConnectionState {
        /// State at the time of the call
        state: ConnectionState,
        /// Rejected operation
        operation: &'static str,
    },

    /// Login handshake signal not observed in time
    #[error("Handshake timed out: {0}")]
    HandshakeTimeout(&'static str),

    /// Beacon completion not observed in time
    #[error("Drain barrier timed out")]
    DrainTimeout,

    /// Malformed request or wire frame
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Verbs provider failure
    #[error("Verbs error: {0}")]
    Verbs(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl IserError {
    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IserError::ResourceExhausted(_))
    }

    /// Whether the error drives the owning connection to TERMINATING.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            IserError::WorkCompletion { .. } | IserError::HandshakeTimeout(_) | IserError::Verbs(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(IserError::ResourceExhausted("registration pool").is_retryable());
        assert!(!IserError::ResourceExhausted("registration pool").is_connection_fatal());

        let wc = IserError::WorkCompletion {
            wr_id: 7,
            status: WcStatus::RemoteAccessError,
        };
        assert!(wc.is_connection_fatal());
        assert!(!wc.is_retryable());

        let big = IserError::BufferTooLarge {
            entries: 300,
            max: 256,
        };
        assert!(!big.is_retryable());
        assert!(!big.is_connection_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = IserError::ConnectionState {
            state: ConnectionState::Terminating,
            operation: "submit",
        };
        assert_eq!(
            err.to_string(),
            "submit rejected in connection state TERMINATING"
        );
    }
}
