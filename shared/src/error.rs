//! Error kinds surfaced by sessions and UUID parsing

use thiserror::Error;

/// Why an operation, batch or connect attempt did not succeed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The transport refused to accept the request at all
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The operation requires a connected peripheral
    #[error("not connected")]
    NotConnected,

    /// No completion arrived within the allowed time
    #[error("operation timed out after {0} ms")]
    OperationTimeout(u64),

    /// The transport reported failure, or the target could not be resolved
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// The connection dropped while the operation was outstanding
    #[error("connection lost")]
    LinkLost,

    /// The session was disposed before the operation could run
    #[error("cancelled")]
    Cancelled,

    /// A completion arrived for a sequence that is no longer awaited
    ///
    /// Only ever logged; never handed to a caller.
    #[error("stale completion for sequence {received} (awaiting {awaiting:?})")]
    StaleCompletion { received: u64, awaiting: Option<u64> },
}

impl SessionError {
    /// Whether this failure means the connection itself is gone
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, SessionError::LinkLost | SessionError::Cancelled)
    }
}

/// Errors produced while expanding GATT UUIDs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UuidError {
    #[error("malformed UUID: {0}")]
    Malformed(String),

    #[error("base UUID must be a complete UUID: {0}")]
    InvalidBase(String),
}
