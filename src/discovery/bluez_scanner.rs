//! BlueZ advertisement scanner feeding the device registry

use super::{AdvertisementReport, DeviceRegistry};
use crate::transport::GattTransport;
use anyhow::Result;
use ble_sequencer_shared::PeripheralAddress;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty};
use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

/// AD type of manufacturer specific data
const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// Flags structure (LE general discoverable, BR/EDR not supported)
const AD_FLAGS: [u8; 3] = [0x02, 0x01, 0x06];

/// Configuration for a scan
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// How long to scan; `None` scans until the future is dropped
    pub scan_duration: Option<Duration>,
    /// Drop stale peripherals every this often while scanning
    pub cleanup_interval: Duration,
    /// Peripherals silent for this long are forgotten
    pub stale_after: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_duration: Some(Duration::from_secs(10)),
            cleanup_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(120),
        }
    }
}

/// Scans with a BlueZ adapter and hands every advertisement to a registry
pub struct BluezScanner {
    config: ScanConfig,
}

impl BluezScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    /// Get the default Bluetooth adapter, powered on
    pub async fn get_adapter() -> Result<Adapter> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        Ok(adapter)
    }

    /// Run one scan, feeding `registry`
    ///
    /// Every device found is followed for as long as the scan runs, so
    /// peripherals that keep advertising keep getting fresh reports.
    pub async fn scan<T: GattTransport>(
        &self,
        adapter: &Adapter,
        registry: &Arc<DeviceRegistry<T>>,
    ) -> Result<()> {
        registry.set_discovery(true);
        let discover = adapter.discover_devices().await?;
        tokio::pin!(discover);

        let mut followers: HashMap<Address, JoinHandle<()>> = HashMap::new();
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval);
        let scan = async {
            loop {
                tokio::select! {
                    event = discover.next() => match event {
                        Some(AdapterEvent::DeviceAdded(addr)) => {
                            let device = match adapter.device(addr) {
                                Ok(device) => device,
                                Err(e) => {
                                    debug!("[DISCOVERY] {} unreadable: {}", addr, e);
                                    continue;
                                }
                            };
                            report(&device, registry).await;
                            followers
                                .entry(addr)
                                .or_insert_with(|| tokio::spawn(follow(device, registry.clone())));
                        }
                        Some(AdapterEvent::DeviceRemoved(addr)) => {
                            if let Some(follower) = followers.remove(&addr) {
                                follower.abort();
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = cleanup.tick() => {
                        registry.cleanup(self.config.stale_after);
                    }
                }
            }
        };

        match self.config.scan_duration {
            Some(duration) => {
                // Timeout is the normal end of a bounded scan
                if timeout(duration, scan).await.is_err() {
                    info!("[DISCOVERY] Scan completed");
                }
            }
            None => scan.await,
        }

        for (_, follower) in followers.drain() {
            follower.abort();
        }
        registry.set_discovery(false);
        Ok(())
    }
}

/// Hand the current state of `device` to the registry
async fn report<T: GattTransport>(device: &Device, registry: &DeviceRegistry<T>) {
    match read_report(device).await {
        Ok(report) => {
            registry.process_advertisement(report);
        }
        Err(e) => debug!("[DISCOVERY] {} unreadable: {}", device.address(), e),
    }
}

/// Re-report a device whenever BlueZ sees a new advertisement from it
async fn follow<T: GattTransport>(device: Device, registry: Arc<DeviceRegistry<T>>) {
    let events = match device.events().await {
        Ok(events) => events,
        Err(e) => {
            debug!("[DISCOVERY] {} cannot be followed: {}", device.address(), e);
            return;
        }
    };
    tokio::pin!(events);

    while let Some(event) = events.next().await {
        match event {
            DeviceEvent::PropertyChanged(property) if refreshes_advertisement(&property) => {
                report(&device, &registry).await;
            }
            _ => {}
        }
    }
}

/// Properties that change when a new advertisement is received
fn refreshes_advertisement(property: &DeviceProperty) -> bool {
    matches!(
        property,
        DeviceProperty::Rssi(_)
            | DeviceProperty::ManufacturerData(_)
            | DeviceProperty::ServiceData(_)
            | DeviceProperty::Name(_)
    )
}

/// Build a report from the properties BlueZ keeps for a device
async fn read_report(device: &Device) -> Result<AdvertisementReport> {
    let services = device.uuids().await?.unwrap_or_default();
    let manufacturer = device.manufacturer_data().await?.unwrap_or_default();

    Ok(AdvertisementReport {
        address: PeripheralAddress::from_bytes(device.address().0),
        local_name: device.name().await?,
        services: services.into_iter().collect(),
        raw: advertising_data(&manufacturer),
        rssi: device.rssi().await?.unwrap_or(i16::MIN),
    })
}

/// Re-encode manufacturer data as advertising data structures
///
/// BlueZ does not expose the raw advertisement, so the flags field and one
/// manufacturer structure per company are rebuilt in the on-air layout.
fn advertising_data(manufacturer: &HashMap<u16, Vec<u8>>) -> Bytes {
    let mut raw = BytesMut::with_capacity(31);
    raw.put_slice(&AD_FLAGS);

    let mut companies: Vec<_> = manufacturer.iter().collect();
    companies.sort_by_key(|(id, _)| **id);
    for (company, data) in companies {
        // length covers the type byte, company id and payload
        let len = (data.len() + 3).min(u8::MAX as usize) as u8;
        raw.put_u8(len);
        raw.put_u8(AD_MANUFACTURER_DATA);
        raw.put_u16_le(*company);
        raw.put_slice(&data[..(len as usize - 3)]);
    }
    raw.freeze()
}
