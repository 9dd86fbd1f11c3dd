//! Observable per-session events

use crate::command::BatchId;
use ble_sequencer_shared::{ConnectionState, PeripheralAddress, SessionError};

/// Emitted on the session's broadcast channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The connection moved to a new state
    StateChanged {
        address: PeripheralAddress,
        from: ConnectionState,
        to: ConnectionState,
    },
    /// An operation was handed to the transport
    OperationStarted {
        batch: BatchId,
        index: usize,
        label: &'static str,
    },
    /// An operation completed successfully
    OperationCompleted {
        batch: BatchId,
        index: usize,
        label: &'static str,
    },
    /// An operation failed
    OperationFailed {
        batch: BatchId,
        index: usize,
        label: &'static str,
        reason: SessionError,
    },
    /// Every operation of the batch succeeded
    BatchCompleted { batch: BatchId },
    /// The batch stopped at `index`
    BatchFailed {
        batch: BatchId,
        index: usize,
        reason: SessionError,
    },
}
