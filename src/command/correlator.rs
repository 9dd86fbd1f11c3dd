//! Completion correlator
//!
//! Pairs each dispatched operation with the one boolean completion the
//! transport eventually reports for it. Every awaited correlation is
//! tagged with a monotonically increasing sequence so that a late or
//! duplicate completion can never be applied to the wrong operation.

use ble_sequencer_shared::SessionError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

/// What can resolve an awaited slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The transport reported the outcome of the request
    Completed(bool),
    /// The link dropped while the request was outstanding
    LinkLost,
    /// The session was disposed
    Cancelled,
    /// The transport dropped its completion token without using it
    Abandoned,
}

#[derive(Debug, Default)]
struct Slot {
    last_sequence: u64,
    awaiting: Option<(u64, oneshot::Sender<Signal>)>,
}

/// Single-slot rendezvous between the executor and the transport
#[derive(Debug, Default)]
pub struct Correlator {
    slot: Mutex<Slot>,
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a new awaited slot
    ///
    /// Returns the token handed to the transport and the handle the
    /// executor awaits. Any slot still open is superseded.
    pub fn arm(self: &Arc<Self>) -> (Completion, PendingCompletion) {
        let (tx, rx) = oneshot::channel();
        let mut slot = self.lock();
        slot.last_sequence += 1;
        let sequence = slot.last_sequence;

        if let Some((previous, _)) = slot.awaiting.replace((sequence, tx)) {
            warn!("[CORRELATOR] Slot {} superseded by {}", previous, sequence);
        }

        (
            Completion {
                sequence,
                correlator: Arc::downgrade(self),
                delivered: false,
            },
            PendingCompletion {
                sequence,
                receiver: rx,
                correlator: Arc::downgrade(self),
            },
        )
    }

    /// Sequence currently awaited, if any
    pub fn awaiting(&self) -> Option<u64> {
        self.lock().awaiting.as_ref().map(|(seq, _)| *seq)
    }

    /// Hand a signal to the slot tagged `sequence`
    ///
    /// A signal for any other sequence is rejected and leaves the awaited
    /// slot untouched.
    pub fn deliver(&self, sequence: u64, signal: Signal) -> Result<(), SessionError> {
        let tx = {
            let mut slot = self.lock();
            let awaiting = slot.awaiting.as_ref().map(|(seq, _)| *seq);
            if awaiting != Some(sequence) {
                return Err(SessionError::StaleCompletion {
                    received: sequence,
                    awaiting,
                });
            }
            slot.awaiting.take().map(|(_, tx)| tx)
        };

        if let Some(tx) = tx {
            if tx.send(signal).is_err() {
                debug!("[CORRELATOR] Slot {} resolved after its waiter left", sequence);
            }
        }
        Ok(())
    }

    /// Resolve whatever is awaited right now with `signal`
    ///
    /// Used for link loss and disposal, which are not tied to a sequence.
    pub fn interrupt(&self, signal: Signal) -> Option<u64> {
        let (sequence, tx) = self.lock().awaiting.take()?;
        debug!("[CORRELATOR] Interrupting slot {} with {:?}", sequence, signal);
        let _ = tx.send(signal);
        Some(sequence)
    }

    /// Close the slot tagged `sequence` without resolving it
    pub fn disarm(&self, sequence: u64) {
        let mut slot = self.lock();
        if matches!(slot.awaiting, Some((awaited, _)) if awaited == sequence) {
            slot.awaiting = None;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Token the transport uses to report the outcome of one request
///
/// May be completed from any thread. Dropping it without completing
/// resolves the slot as a failure.
#[derive(Debug)]
pub struct Completion {
    sequence: u64,
    correlator: Weak<Correlator>,
    delivered: bool,
}

impl Completion {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Report the outcome of the request
    pub fn complete(mut self, success: bool) {
        self.delivered = true;
        self.send(Signal::Completed(success));
    }

    fn send(&self, signal: Signal) {
        let Some(correlator) = self.correlator.upgrade() else {
            return;
        };

        if let Err(e) = correlator.deliver(self.sequence, signal) {
            match signal {
                Signal::Completed(_) => warn!("[CORRELATOR] Discarded: {}", e),
                _ => debug!("[CORRELATOR] Discarded: {}", e),
            }
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.delivered {
            self.send(Signal::Abandoned);
        }
    }
}

/// Executor side of an armed slot
#[derive(Debug)]
pub struct PendingCompletion {
    sequence: u64,
    receiver: oneshot::Receiver<Signal>,
    correlator: Weak<Correlator>,
}

impl PendingCompletion {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Wait for the transport to report, bounded by `limit`
    ///
    /// `Ok(false)` means the transport reported failure. The slot is closed
    /// when this returns, so anything arriving later is stale.
    pub async fn wait(self, limit: Duration) -> Result<bool, SessionError> {
        let PendingCompletion {
            sequence,
            receiver,
            correlator,
        } = self;

        let outcome = match timeout(limit, receiver).await {
            Ok(Ok(Signal::Completed(success))) => Ok(success),
            Ok(Ok(Signal::LinkLost)) => Err(SessionError::LinkLost),
            Ok(Ok(Signal::Cancelled)) | Ok(Err(_)) => Err(SessionError::Cancelled),
            Ok(Ok(Signal::Abandoned)) => Err(SessionError::OperationFailed(
                "transport dropped the completion".into(),
            )),
            Err(_) => Err(SessionError::OperationTimeout(limit.as_millis() as u64)),
        };

        if let Some(correlator) = correlator.upgrade() {
            correlator.disarm(sequence);
        }
        outcome
    }
}
