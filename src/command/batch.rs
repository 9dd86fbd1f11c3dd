//! Batches and the fluent builder used to assemble them

use super::operation::{Operation, OperationKind};
use ble_sequencer_shared::{cccd, CharacteristicHandle, SessionError, Uuid};
use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Identifier assigned to a batch when it is submitted
pub type BatchId = u64;

pub type CompleteCallback = Box<dyn FnOnce() + Send + 'static>;
pub type FailedCallback = Box<dyn FnOnce(usize, SessionError) + Send + 'static>;

/// Why a batch did not complete: the failing operation and the reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub index: usize,
    pub reason: SessionError,
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation {} failed: {}", self.index, self.reason)
    }
}

impl std::error::Error for BatchFailure {}

/// Ordered operations executed as a unit
pub struct Batch {
    id: BatchId,
    operations: Vec<Operation>,
    on_complete: Option<CompleteCallback>,
    on_failed: Option<FailedCallback>,
}

impl Batch {
    pub fn new<C, F>(operations: Vec<Operation>, on_complete: C, on_failed: F) -> Self
    where
        C: FnOnce() + Send + 'static,
        F: FnOnce(usize, SessionError) + Send + 'static,
    {
        Self {
            id: 0,
            operations,
            on_complete: Some(Box::new(on_complete)),
            on_failed: Some(Box::new(on_failed)),
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub(crate) fn assign_id(&mut self, id: BatchId) {
        self.id = id;
    }

    pub(crate) fn into_parts(self) -> (BatchId, Vec<Operation>, BatchCallbacks) {
        (
            self.id,
            self.operations,
            BatchCallbacks {
                on_complete: self.on_complete,
                on_failed: self.on_failed,
            },
        )
    }

    /// Fail a batch none of whose operations were dispatched
    ///
    /// Every operation hears `false`, then `on_failed(0, reason)` fires.
    pub fn fail_all(self, reason: SessionError) {
        let (_, operations, callbacks) = self.into_parts();
        for op in operations {
            op.resolve(false);
        }
        callbacks.failed(0, reason);
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("id", &self.id)
            .field("operations", &self.operations)
            .finish()
    }
}

/// Terminal callbacks of a batch; exactly one of them ever runs
pub(crate) struct BatchCallbacks {
    on_complete: Option<CompleteCallback>,
    on_failed: Option<FailedCallback>,
}

impl BatchCallbacks {
    pub(crate) fn completed(self) {
        if let Some(callback) = self.on_complete {
            callback();
        }
    }

    pub(crate) fn failed(self, index: usize, reason: SessionError) {
        if let Some(callback) = self.on_failed {
            callback(index, reason);
        }
    }
}

/// Fluent builder for a batch
///
/// ```ignore
/// session.post(
///     |b| b.connect().write(handle, vec![0x01]).timeout(Duration::from_secs(2)),
///     || println!("done"),
///     |index, reason| println!("step {index} failed: {reason}"),
/// );
/// ```
#[derive(Debug, Default)]
pub struct BatchBuilder {
    operations: Vec<Operation>,
}

impl BatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Append a raw operation
    pub fn push(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn connect(self) -> Self {
        self.push(Operation::new(OperationKind::Connect))
    }

    pub fn connect_then<F>(self, callback: F) -> Self
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.push(Operation::new(OperationKind::Connect).with_callback(callback))
    }

    pub fn write(self, handle: CharacteristicHandle, payload: impl Into<Bytes>) -> Self {
        self.push(Operation::new(OperationKind::WriteCharacteristic {
            handle,
            payload: payload.into(),
        }))
    }

    pub fn write_then<F>(
        self,
        handle: CharacteristicHandle,
        payload: impl Into<Bytes>,
        callback: F,
    ) -> Self
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let op = Operation::new(OperationKind::WriteCharacteristic {
            handle,
            payload: payload.into(),
        });
        self.push(op.with_callback(callback))
    }

    /// Enable notifications through the descriptor `descriptor`
    pub fn enable_notifications(self, handle: CharacteristicHandle, descriptor: Uuid) -> Self {
        self.push(notification(handle, descriptor, true))
    }

    pub fn enable_notifications_then<F>(
        self,
        handle: CharacteristicHandle,
        descriptor: Uuid,
        callback: F,
    ) -> Self
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.push(notification(handle, descriptor, true).with_callback(callback))
    }

    pub fn disable_notifications(self, handle: CharacteristicHandle, descriptor: Uuid) -> Self {
        self.push(notification(handle, descriptor, false))
    }

    pub fn disable_notifications_then<F>(
        self,
        handle: CharacteristicHandle,
        descriptor: Uuid,
        callback: F,
    ) -> Self
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.push(notification(handle, descriptor, false).with_callback(callback))
    }

    /// Override the completion timeout of the most recently added step
    pub fn timeout(mut self, timeout: Duration) -> Self {
        match self.operations.last_mut() {
            Some(op) => op.timeout = Some(timeout),
            None => warn!("[SESSION] timeout() called on an empty batch, ignored"),
        }
        self
    }

    /// Append all steps of another builder after the current ones
    pub fn append(mut self, other: BatchBuilder) -> Self {
        self.operations.extend(other.operations);
        self
    }

    pub fn build<C, F>(self, on_complete: C, on_failed: F) -> Batch
    where
        C: FnOnce() + Send + 'static,
        F: FnOnce(usize, SessionError) + Send + 'static,
    {
        Batch::new(self.operations, on_complete, on_failed)
    }
}

fn notification(handle: CharacteristicHandle, descriptor: Uuid, enable: bool) -> Operation {
    Operation::new(OperationKind::SetNotification {
        handle,
        descriptor,
        enable,
    })
}

/// Descriptor value written for a notification toggle
pub fn descriptor_value(enable: bool) -> Bytes {
    if enable {
        Bytes::from_static(&cccd::ENABLE_NOTIFICATION_VALUE)
    } else {
        Bytes::from_static(&cccd::DISABLE_NOTIFICATION_VALUE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ble_sequencer_shared::gatt_uuid::CLIENT_CHARACTERISTIC_CONFIGURATION;
    use std::sync::{Arc, Mutex};

    fn handle(c: &str) -> CharacteristicHandle {
        CharacteristicHandle::parse("fff0", c).unwrap()
    }

    #[test]
    fn test_builder_preserves_order() {
        let batch = BatchBuilder::new()
            .connect()
            .write(handle("fff1"), vec![0x01])
            .enable_notifications(handle("fff2"), CLIENT_CHARACTERISTIC_CONFIGURATION)
            .build(|| {}, |_, _| {});

        let labels: Vec<_> = batch.operations().iter().map(|o| o.kind.label()).collect();
        assert_eq!(labels, vec!["connect", "write", "enable-notifications"]);
    }

    #[test]
    fn test_timeout_applies_to_last_step() {
        let batch = BatchBuilder::new()
            .connect()
            .write(handle("fff1"), vec![0x01])
            .timeout(Duration::from_millis(250))
            .build(|| {}, |_, _| {});

        assert_eq!(batch.operations()[0].timeout, None);
        assert_eq!(batch.operations()[1].timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_append() {
        let tail = BatchBuilder::new().write(handle("fff1"), vec![0x02]);
        let batch = BatchBuilder::new().connect().append(tail).build(|| {}, |_, _| {});
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_fail_all_reports_every_operation() {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let failure = Arc::new(Mutex::new(None));

        let (o1, o2, f) = (outcomes.clone(), outcomes.clone(), failure.clone());
        let batch = BatchBuilder::new()
            .connect_then(move |ok| o1.lock().unwrap().push(ok))
            .write_then(handle("fff1"), vec![0x01], move |ok| o2.lock().unwrap().push(ok))
            .build(
                || panic!("must not complete"),
                move |index, reason| *f.lock().unwrap() = Some((index, reason)),
            );

        batch.fail_all(SessionError::Cancelled);
        assert_eq!(*outcomes.lock().unwrap(), vec![false, false]);
        assert_eq!(
            *failure.lock().unwrap(),
            Some((0, SessionError::Cancelled))
        );
    }

    #[test]
    fn test_descriptor_values() {
        assert_eq!(&descriptor_value(true)[..], &[0x01, 0x00]);
        assert_eq!(&descriptor_value(false)[..], &[0x00, 0x00]);
    }

    #[test]
    fn test_failure_display() {
        let failure = BatchFailure {
            index: 1,
            reason: SessionError::NotConnected,
        };
        assert_eq!(failure.to_string(), "operation 1 failed: not connected");
    }
}
