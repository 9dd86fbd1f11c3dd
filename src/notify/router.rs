//! Routes unsolicited characteristic notifications to observers
//!
//! Notifications bypass the operation queue entirely: the transport hands
//! them to the router, which fans them out to every live subscription for
//! that characteristic.

use ble_sequencer_shared::{CharacteristicHandle, PeripheralAddress};
use bytes::Bytes;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, trace};

struct Observer {
    id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

/// Per-session table of notification observers
pub struct NotificationRouter {
    address: PeripheralAddress,
    observers: Mutex<HashMap<CharacteristicHandle, Vec<Observer>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl NotificationRouter {
    pub fn new(address: PeripheralAddress) -> Arc<Self> {
        Arc::new(Self {
            address,
            observers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    /// Observe notifications of `handle`
    ///
    /// Subscribing to a torn-down router yields a subscription that is
    /// already closed.
    pub fn subscribe(self: &Arc<Self>, handle: CharacteristicHandle) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if !self.closed.load(Ordering::Acquire) {
            self.lock()
                .entry(handle)
                .or_default()
                .push(Observer { id, tx });
            debug!("[NOTIFY] {} subscription {} on {}", self.address, id, handle);
        }

        Subscription {
            id,
            handle,
            receiver: rx,
            router: Arc::downgrade(self),
        }
    }

    /// Deliver a notification; returns how many observers received it
    pub fn dispatch(&self, handle: CharacteristicHandle, payload: Bytes) -> usize {
        let mut observers = self.lock();
        let Some(list) = observers.get_mut(&handle) else {
            trace!("[NOTIFY] {} unobserved notification on {}", self.address, handle);
            return 0;
        };

        // Observers whose receiving side is gone are pruned on the way
        list.retain(|o| o.tx.send(payload.clone()).is_ok());
        let delivered = list.len();
        if list.is_empty() {
            observers.remove(&handle);
        }
        delivered
    }

    pub fn observer_count(&self, handle: CharacteristicHandle) -> usize {
        self.lock().get(&handle).map_or(0, Vec::len)
    }

    /// Drop every subscription and refuse new ones
    pub fn clear(&self) {
        self.closed.store(true, Ordering::Release);
        let dropped: usize = self.lock().drain().map(|(_, list)| list.len()).sum();
        if dropped > 0 {
            debug!("[NOTIFY] {} released {} subscriptions", self.address, dropped);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn unsubscribe(&self, handle: CharacteristicHandle, id: u64) {
        let mut observers = self.lock();
        if let Some(list) = observers.get_mut(&handle) {
            list.retain(|o| o.id != id);
            if list.is_empty() {
                observers.remove(&handle);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CharacteristicHandle, Vec<Observer>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Live notification subscription; unsubscribes when dropped
pub struct Subscription {
    id: u64,
    handle: CharacteristicHandle,
    receiver: mpsc::UnboundedReceiver<Bytes>,
    router: Weak<NotificationRouter>,
}

impl Subscription {
    pub fn handle(&self) -> CharacteristicHandle {
        self.handle
    }

    /// Next notification value, or `None` once the session is torn down
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.unsubscribe(self.handle, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .finish()
    }
}
