//! How far an operation failure reaches

use super::Operation;
use ble_sequencer_shared::{ConnectionState, SessionError};
use tracing::debug;

/// Scope of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cascade {
    /// Skip the rest of the failing batch and carry on with the queue
    AbortBatch,
    /// The connection is gone: fail everything queued and stop
    HaltSession,
}

/// Decide the scope of a failure from its reason and the link state after it
pub fn classify(reason: &SessionError, state: ConnectionState) -> Cascade {
    if reason.is_connection_failure() || state == ConnectionState::Disconnected {
        Cascade::HaltSession
    } else {
        Cascade::AbortBatch
    }
}

/// Dispose of the operations after a failed one
///
/// A plain batch abort drops them silently. When the session halts, each of
/// them is told it failed.
pub fn discard_remainder(rest: impl IntoIterator<Item = Operation>, cascade: Cascade) {
    let mut skipped = 0usize;
    for op in rest {
        if cascade == Cascade::HaltSession {
            op.resolve(false);
        }
        skipped += 1;
    }
    if skipped > 0 {
        debug!("[SESSION] {} remaining operations skipped ({:?})", skipped, cascade);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::OperationKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_classify() {
        use ConnectionState::*;

        assert_eq!(classify(&SessionError::OperationTimeout(5000), Connected), Cascade::AbortBatch);
        assert_eq!(classify(&SessionError::NotConnected, Idle), Cascade::AbortBatch);
        assert_eq!(classify(&SessionError::LinkLost, Disconnected), Cascade::HaltSession);
        assert_eq!(classify(&SessionError::Cancelled, Connected), Cascade::HaltSession);

        // A failed connect leaves the link terminal
        assert_eq!(
            classify(&SessionError::OperationFailed("handshake".into()), Disconnected),
            Cascade::HaltSession
        );
    }

    #[test]
    fn test_discard_remainder() {
        let failed = Arc::new(AtomicUsize::new(0));
        let ops = || {
            (0..3)
                .map(|_| {
                    let failed = failed.clone();
                    Operation::new(OperationKind::Connect).with_callback(move |ok| {
                        if !ok {
                            failed.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect::<Vec<_>>()
        };

        discard_remainder(ops(), Cascade::AbortBatch);
        assert_eq!(failed.load(Ordering::SeqCst), 0);

        discard_remainder(ops(), Cascade::HaltSession);
        assert_eq!(failed.load(Ordering::SeqCst), 3);
    }
}
