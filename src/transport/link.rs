//! Channel for unsolicited link events

use crate::notify::NotificationRouter;
use ble_sequencer_shared::{CharacteristicHandle, PeripheralAddress};
use bytes::Bytes;
use std::fmt;
use std::sync::Weak;

/// Receives the loss of a link
pub trait LinkObserver: Send + Sync {
    fn link_lost(&self);
}

/// Handed to the transport at connect time
///
/// Holds only weak references, so a transport that keeps a sink around
/// after the session is gone does not keep the session alive.
#[derive(Clone)]
pub struct LinkSink {
    address: PeripheralAddress,
    router: Weak<NotificationRouter>,
    observer: Weak<dyn LinkObserver>,
}

impl LinkSink {
    pub fn new(
        address: PeripheralAddress,
        router: Weak<NotificationRouter>,
        observer: Weak<dyn LinkObserver>,
    ) -> Self {
        Self {
            address,
            router,
            observer,
        }
    }

    pub fn address(&self) -> &PeripheralAddress {
        &self.address
    }

    /// A characteristic value arrived; returns how many observers got it
    pub fn notify(&self, handle: CharacteristicHandle, payload: Bytes) -> usize {
        self.router
            .upgrade()
            .map_or(0, |router| router.dispatch(handle, payload))
    }

    /// The physical link dropped
    pub fn disconnected(&self) {
        if let Some(observer) = self.observer.upgrade() {
            observer.link_lost();
        }
    }

    /// Whether the owning session still exists
    pub fn is_attached(&self) -> bool {
        self.observer.strong_count() > 0
    }
}

impl fmt::Debug for LinkSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkSink")
            .field("address", &self.address)
            .field("attached", &self.is_attached())
            .finish()
    }
}
