//! A known peripheral and its latest advertisement

use crate::command::{BatchBuilder, BatchFailure, BatchId};
use crate::session::{Session, SessionManager};
use crate::transport::GattTransport;
use ble_sequencer_shared::{now_ms, ConnectionState, PeripheralAddress, SessionError};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Kind of device an identifier recognised
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceClass(String);

impl DeviceClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceClass {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Latest advertisement seen from a peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub raw: Bytes,
    pub rssi: i16,
    pub local_name: Option<String>,
    pub last_seen_ms: u64,
}

/// A peripheral tracked by the device registry
///
/// Operations go through the session manager, so a peripheral always
/// talks to the live session of its address.
pub struct Peripheral<T: GattTransport> {
    address: PeripheralAddress,
    class: DeviceClass,
    sessions: Arc<SessionManager<T>>,
    advertisement: watch::Sender<Advertisement>,
}

impl<T: GattTransport> Peripheral<T> {
    pub fn new(address: PeripheralAddress, class: DeviceClass, sessions: Arc<SessionManager<T>>) -> Self {
        let (advertisement, _) = watch::channel(Advertisement {
            raw: Bytes::new(),
            rssi: i16::MIN,
            local_name: None,
            last_seen_ms: now_ms(),
        });
        Self {
            address,
            class,
            sessions,
            advertisement,
        }
    }

    pub fn address(&self) -> &PeripheralAddress {
        &self.address
    }

    pub fn class(&self) -> &DeviceClass {
        &self.class
    }

    pub fn advertisement(&self) -> Advertisement {
        self.advertisement.borrow().clone()
    }

    pub fn rssi(&self) -> i16 {
        self.advertisement.borrow().rssi
    }

    pub fn last_seen_ms(&self) -> u64 {
        self.advertisement.borrow().last_seen_ms
    }

    /// Record a fresh advertisement
    pub fn update_advertisement(&self, raw: Bytes, rssi: i16, local_name: Option<String>) {
        self.advertisement.send_modify(|adv| {
            adv.raw = raw;
            adv.rssi = rssi;
            if local_name.is_some() {
                adv.local_name = local_name;
            }
            adv.last_seen_ms = now_ms();
        });
    }

    /// Note that the peripheral is still around without new data
    pub fn mark_seen(&self) {
        self.advertisement.send_modify(|adv| adv.last_seen_ms = now_ms());
    }

    /// Follow advertisement updates
    pub fn watch(&self) -> watch::Receiver<Advertisement> {
        self.advertisement.subscribe()
    }

    pub fn session(&self) -> Session<T> {
        self.sessions.session(&self.address)
    }

    pub fn state(&self) -> ConnectionState {
        self.sessions
            .get(&self.address)
            .map_or(ConnectionState::Idle, |s| s.state())
    }

    pub fn post<B, C, F>(&self, build: B, on_complete: C, on_failed: F) -> BatchId
    where
        B: FnOnce(BatchBuilder) -> BatchBuilder,
        C: FnOnce() + Send + 'static,
        F: FnOnce(usize, SessionError) + Send + 'static,
    {
        self.sessions.post(&self.address, build, on_complete, on_failed)
    }

    pub async fn request<B>(&self, build: B) -> Result<(), BatchFailure>
    where
        B: FnOnce(BatchBuilder) -> BatchBuilder,
    {
        self.sessions.request(&self.address, build).await
    }

    pub async fn connect(&self) -> Result<(), SessionError> {
        self.sessions.connect(&self.address).await
    }

    /// Drop the link and everything queued on it
    pub fn disconnect(&self) -> bool {
        self.sessions.dispose(&self.address)
    }
}

impl<T: GattTransport> fmt::Debug for Peripheral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peripheral")
            .field("address", &self.address)
            .field("class", &self.class)
            .field("rssi", &self.rssi())
            .finish()
    }
}
