//! Operation executor - dispatches one batch at a time against the link

use super::batch::{descriptor_value, Batch, BatchFailure, BatchId};
use super::correlator::{Completion, Correlator};
use super::operation::OperationKind;
use super::policy::{self, Cascade};
use crate::connection::ConnectionManager;
use crate::session::SessionEvent;
use crate::transport::GattTransport;
use ble_sequencer_shared::{PeripheralAddress, SessionError};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Result of running one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every operation succeeded
    Completed,
    /// An operation failed; the queue carries on
    Aborted(BatchFailure),
    /// The connection is gone; nothing more can run on this session
    Halted(BatchFailure),
}

/// The operation currently being executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub batch: BatchId,
    pub index: usize,
    pub label: &'static str,
}

/// Executes batches for one session
pub struct OperationExecutor<T: GattTransport> {
    address: PeripheralAddress,
    transport: Arc<T>,
    connection: Arc<ConnectionManager<T>>,
    correlator: Arc<Correlator>,
    events: broadcast::Sender<SessionEvent>,
    operation_timeout: Duration,
    current: Mutex<Option<InFlight>>,
}

impl<T: GattTransport> OperationExecutor<T> {
    pub fn new(
        address: PeripheralAddress,
        transport: Arc<T>,
        connection: Arc<ConnectionManager<T>>,
        correlator: Arc<Correlator>,
        events: broadcast::Sender<SessionEvent>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            address,
            transport,
            connection,
            correlator,
            events,
            operation_timeout,
            current: Mutex::new(None),
        }
    }

    /// The operation in flight right now, if any
    pub fn current(&self) -> Option<InFlight> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run every operation of `batch` in order, stopping at the first failure
    pub async fn run_batch(&self, batch: Batch) -> BatchOutcome {
        let (id, operations, callbacks) = batch.into_parts();
        debug!(
            "[SESSION] {} batch {} started ({} operations)",
            self.address,
            id,
            operations.len()
        );

        let mut remaining = operations.into_iter().enumerate();
        while let Some((index, op)) = remaining.next() {
            let label = op.kind.label();
            self.set_current(Some(InFlight {
                batch: id,
                index,
                label,
            }));
            self.emit(SessionEvent::OperationStarted {
                batch: id,
                index,
                label,
            });
            debug!("[SESSION] {} batch {} op {}: {}", self.address, id, index, op.kind);

            let result = self.execute(&op.kind, op.timeout).await;
            self.set_current(None);

            let reason = match result {
                Ok(()) => {
                    self.emit(SessionEvent::OperationCompleted {
                        batch: id,
                        index,
                        label,
                    });
                    op.resolve(true);
                    continue;
                }
                Err(reason) => reason,
            };

            warn!(
                "[SESSION] {} batch {} op {} ({}) failed: {}",
                self.address, id, index, label, reason
            );
            self.emit(SessionEvent::OperationFailed {
                batch: id,
                index,
                label,
                reason: reason.clone(),
            });
            op.resolve(false);

            let cascade = policy::classify(&reason, self.connection.state());
            policy::discard_remainder(remaining.map(|(_, op)| op), cascade);

            self.emit(SessionEvent::BatchFailed {
                batch: id,
                index,
                reason: reason.clone(),
            });
            callbacks.failed(index, reason.clone());

            let failure = BatchFailure { index, reason };
            return match cascade {
                Cascade::AbortBatch => BatchOutcome::Aborted(failure),
                Cascade::HaltSession => BatchOutcome::Halted(failure),
            };
        }

        info!("[SESSION] {} batch {} completed", self.address, id);
        self.emit(SessionEvent::BatchCompleted { batch: id });
        callbacks.completed();
        BatchOutcome::Completed
    }

    /// Execute a single operation to completion
    ///
    /// `timeout_override` replaces the session default for this operation.
    pub async fn execute(
        &self,
        kind: &OperationKind,
        timeout_override: Option<Duration>,
    ) -> Result<(), SessionError> {
        let limit = timeout_override.unwrap_or(self.operation_timeout);

        match kind {
            OperationKind::Connect => match timeout_override {
                Some(limit) => timeout(limit, self.connection.connect())
                    .await
                    .unwrap_or(Err(SessionError::OperationTimeout(limit.as_millis() as u64))),
                None => self.connection.connect().await,
            },

            OperationKind::WriteCharacteristic { handle, payload } => {
                let target = self.connection.resolve(*handle)?;
                self.await_completion(limit, |done| {
                    self.transport
                        .write_characteristic(&target, payload.clone(), done)
                })
                .await
            }

            OperationKind::SetNotification {
                handle,
                descriptor,
                enable,
            } => {
                let target = self.connection.resolve(*handle)?;
                let value = descriptor_value(*enable);
                let started = Instant::now();
                self.await_completion(limit, |done| {
                    self.transport
                        .write_descriptor(&target, *descriptor, value, done)
                })
                .await?;

                // Both steps share one deadline
                let remaining = limit.saturating_sub(started.elapsed());
                let toggle = self.transport.set_local_notification(&target, *handle, *enable);
                match timeout(remaining, toggle).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(SessionError::OperationFailed(format!(
                        "local notification toggle failed: {}",
                        e
                    ))),
                    Err(_) => Err(SessionError::OperationTimeout(limit.as_millis() as u64)),
                }
            }
        }
    }

    /// Dispatch a request and wait for its completion through the correlator
    async fn await_completion<F, Fut>(&self, limit: Duration, dispatch: F) -> Result<(), SessionError>
    where
        F: FnOnce(Completion) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let (done, pending) = self.correlator.arm();
        let sequence = pending.sequence();

        // A link lost before the slot was armed would never interrupt it
        if self.connection.is_terminal() {
            self.correlator.disarm(sequence);
            return Err(SessionError::LinkLost);
        }

        if let Err(e) = dispatch(done).await {
            self.correlator.disarm(sequence);
            return Err(SessionError::TransportUnavailable(e.to_string()));
        }

        match pending.wait(limit).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(SessionError::OperationFailed("transport reported failure".into())),
            Err(e) => Err(e),
        }
    }

    fn set_current(&self, current: Option<InFlight>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = current;
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
