//! Single steps of a batch

use ble_sequencer_shared::{CharacteristicHandle, Uuid};
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

/// Per-operation result callback, invoked exactly once with the outcome
pub type ResultCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// What an operation does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// Bring the link up (no-op when already connected)
    Connect,
    /// Write `payload` to the characteristic
    WriteCharacteristic {
        handle: CharacteristicHandle,
        payload: Bytes,
    },
    /// Write the notification descriptor, then toggle local delivery
    SetNotification {
        handle: CharacteristicHandle,
        descriptor: Uuid,
        enable: bool,
    },
}

impl OperationKind {
    /// Short name used in logs and events
    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::Connect => "connect",
            OperationKind::WriteCharacteristic { .. } => "write",
            OperationKind::SetNotification { enable: true, .. } => "enable-notifications",
            OperationKind::SetNotification { enable: false, .. } => "disable-notifications",
        }
    }

    /// Characteristic targeted by this operation
    pub fn handle(&self) -> Option<CharacteristicHandle> {
        match self {
            OperationKind::Connect => None,
            OperationKind::WriteCharacteristic { handle, .. }
            | OperationKind::SetNotification { handle, .. } => Some(*handle),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.handle() {
            Some(handle) => write!(f, "{} {}", self.label(), handle),
            None => f.write_str(self.label()),
        }
    }
}

/// One step of a batch together with its callback
pub struct Operation {
    pub kind: OperationKind,
    /// Overrides the session's operation timeout for this step only
    pub timeout: Option<Duration>,
    callback: Option<ResultCallback>,
}

impl Operation {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            timeout: None,
            callback: None,
        }
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Report the outcome to the caller
    pub fn resolve(mut self, success: bool) {
        if let Some(callback) = self.callback.take() {
            callback(success);
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind)
            .field("timeout", &self.timeout)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}
