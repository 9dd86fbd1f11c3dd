//! Device registry: turns advertisement reports into known peripherals

use super::peripheral::{DeviceClass, Peripheral};
use crate::session::SessionManager;
use crate::transport::GattTransport;
use ble_sequencer_shared::{gatt_uuid, now_ms, PeripheralAddress, Uuid, UuidError};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Apple company identifier, as it appears in iBeacon manufacturer data
const BEACON_PREFIX: [u8; 2] = [0x4C, 0x00];

/// One advertisement as reported by a scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementReport {
    pub address: PeripheralAddress,
    pub local_name: Option<String>,
    pub services: Vec<Uuid>,
    /// Raw advertising data structures
    pub raw: Bytes,
    pub rssi: i16,
}

impl AdvertisementReport {
    /// Whether the payload is a beacon frame rather than a device advertisement
    ///
    /// Expects the manufacturer data structure right after the flags field.
    pub fn is_beacon(&self) -> bool {
        self.raw.get(5..7) == Some(&BEACON_PREFIX[..])
    }
}

/// Recognises device classes from advertisements
pub trait Identify: Send + Sync {
    fn identify(&self, report: &AdvertisementReport) -> Option<DeviceClass>;
}

impl<F> Identify for F
where
    F: Fn(&AdvertisementReport) -> Option<DeviceClass> + Send + Sync,
{
    fn identify(&self, report: &AdvertisementReport) -> Option<DeviceClass> {
        self(report)
    }
}

type RawMatcher = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Declarative identifier: name, advertised services and a raw-data check
/// must all match
pub struct Identifier {
    class: DeviceClass,
    name: Option<String>,
    services: Vec<Uuid>,
    matcher: Option<RawMatcher>,
}

impl Identifier {
    pub fn new(class: impl Into<DeviceClass>) -> Self {
        Self {
            class: class.into(),
            name: None,
            services: Vec::new(),
            matcher: None,
        }
    }

    /// Require this exact advertised name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Require an advertised service; short forms are expanded
    pub fn service(mut self, uuid: &str) -> Result<Self, UuidError> {
        self.services.push(gatt_uuid::expand(uuid)?);
        Ok(self)
    }

    /// Require the raw advertisement to pass `matcher`
    pub fn raw<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.matcher = Some(Box::new(matcher));
        self
    }
}

impl Identify for Identifier {
    fn identify(&self, report: &AdvertisementReport) -> Option<DeviceClass> {
        if self.name.is_some() && self.name != report.local_name {
            return None;
        }
        if !self.services.iter().all(|s| report.services.contains(s)) {
            return None;
        }
        if let Some(matcher) = &self.matcher {
            if !matcher(&report.raw) {
                return None;
            }
        }
        Some(self.class.clone())
    }
}

/// Registry of known peripherals
pub struct DeviceRegistry<T: GattTransport> {
    sessions: Arc<SessionManager<T>>,
    identifiers: RwLock<Vec<Arc<dyn Identify>>>,
    devices: RwLock<HashMap<PeripheralAddress, Arc<Peripheral<T>>>>,
    rejected: RwLock<HashSet<PeripheralAddress>>,
    discovery: AtomicBool,
    added: broadcast::Sender<PeripheralAddress>,
}

impl<T: GattTransport> DeviceRegistry<T> {
    pub fn new(sessions: Arc<SessionManager<T>>) -> Self {
        let (added, _) = broadcast::channel(sessions.config().event_capacity.max(1));
        Self {
            sessions,
            identifiers: RwLock::new(Vec::new()),
            devices: RwLock::new(HashMap::new()),
            rejected: RwLock::new(HashSet::new()),
            discovery: AtomicBool::new(false),
            added,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager<T>> {
        &self.sessions
    }

    /// Register an identifier
    ///
    /// Addresses rejected so far get another chance against the new set.
    pub fn add_identifier(&self, identifier: impl Identify + 'static) {
        write(&self.identifiers).push(Arc::new(identifier));
        write(&self.rejected).clear();
    }

    /// Whether unknown advertisers are offered to the identifiers
    pub fn set_discovery(&self, enabled: bool) {
        self.discovery.store(enabled, Ordering::SeqCst);
        info!(
            "[DISCOVERY] discovery {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery.load(Ordering::SeqCst)
    }

    /// Notified with the address of every peripheral added to the registry
    pub fn watch_added(&self) -> broadcast::Receiver<PeripheralAddress> {
        self.added.subscribe()
    }

    /// Feed one advertisement report
    ///
    /// Returns the peripheral the report belongs to, if any.
    pub fn process_advertisement(&self, report: AdvertisementReport) -> Option<Arc<Peripheral<T>>> {
        if read(&self.rejected).contains(&report.address) {
            return None;
        }

        if let Some(peripheral) = self.get(&report.address) {
            if report.is_beacon() {
                peripheral.mark_seen();
            } else {
                peripheral.update_advertisement(report.raw, report.rssi, report.local_name);
            }
            return Some(peripheral);
        }

        if !self.is_discovering() || report.is_beacon() {
            return None;
        }

        let class = read(&self.identifiers)
            .iter()
            .find_map(|identifier| identifier.identify(&report));

        match class {
            Some(class) => {
                info!(
                    "[DISCOVERY] {} identified as {} (rssi {})",
                    report.address, class, report.rssi
                );
                let peripheral = self.inject(report.address.clone(), class);
                peripheral.update_advertisement(report.raw, report.rssi, report.local_name);
                Some(peripheral)
            }
            None => {
                debug!("[DISCOVERY] {} not recognised", report.address);
                write(&self.rejected).insert(report.address);
                None
            }
        }
    }

    /// Add a peripheral by hand, replacing any entry for the same address
    pub fn inject(&self, address: PeripheralAddress, class: DeviceClass) -> Arc<Peripheral<T>> {
        let peripheral = Arc::new(Peripheral::new(address.clone(), class, self.sessions.clone()));
        write(&self.rejected).remove(&address);
        write(&self.devices).insert(address.clone(), peripheral.clone());
        let _ = self.added.send(address);
        peripheral
    }

    /// Drop a peripheral from the registry
    ///
    /// Its session is left alone: a connected peripheral often stops
    /// advertising, and going quiet must not tear its link down. Use
    /// [`Peripheral::disconnect`] to release the link.
    pub fn forget(&self, address: &PeripheralAddress) -> bool {
        write(&self.rejected).remove(address);
        let removed = write(&self.devices).remove(address).is_some();
        if removed {
            debug!("[DISCOVERY] {} forgotten", address);
        }
        removed
    }

    pub fn get(&self, address: &PeripheralAddress) -> Option<Arc<Peripheral<T>>> {
        read(&self.devices).get(address).cloned()
    }

    pub fn devices(&self) -> Vec<Arc<Peripheral<T>>> {
        read(&self.devices).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        read(&self.devices).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.devices).is_empty()
    }

    /// Forget every peripheral not seen for longer than `stale`
    pub fn cleanup(&self, stale: Duration) -> Vec<PeripheralAddress> {
        let now = now_ms();
        let limit = stale.as_millis() as u64;
        let expired: Vec<_> = read(&self.devices)
            .values()
            .filter(|p| now.saturating_sub(p.last_seen_ms()) > limit)
            .map(|p| p.address().clone())
            .collect();

        for address in &expired {
            self.forget(address);
        }
        if !expired.is_empty() {
            info!("[DISCOVERY] cleaned up {} stale peripherals", expired.len());
        }
        expired
    }
}

fn read<V>(lock: &RwLock<V>) -> std::sync::RwLockReadGuard<'_, V> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<V>(lock: &RwLock<V>) -> std::sync::RwLockWriteGuard<'_, V> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
