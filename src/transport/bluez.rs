//! BlueZ GATT client transport

use super::{CharacteristicMap, GattTransport, LinkSink};
use crate::command::Completion;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ble_sequencer_shared::{gatt_uuid, timing, CharacteristicHandle, PeripheralAddress, Uuid};
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, Address, Device, DeviceEvent, DeviceProperty};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How often service resolution is polled after a connect
const SERVICES_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Characteristic reference on a BlueZ link
#[derive(Clone)]
pub struct BluezCharacteristic {
    address: PeripheralAddress,
    inner: Characteristic,
}

#[derive(Default)]
struct LinkEntry {
    sink: Option<LinkSink>,
    connecting: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    notifications: HashMap<CharacteristicHandle, JoinHandle<()>>,
}

impl LinkEntry {
    fn abort_all(&mut self) {
        if let Some(connecting) = self.connecting.take() {
            connecting.abort();
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        for (_, task) in self.notifications.drain() {
            task.abort();
        }
    }
}

/// GATT transport over the BlueZ D-Bus API
pub struct BluezTransport {
    adapter: Adapter,
    resolve_timeout: Duration,
    links: Arc<Mutex<HashMap<PeripheralAddress, LinkEntry>>>,
}

impl BluezTransport {
    /// Use the default adapter, powering it on
    pub async fn new() -> Result<Self> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        info!("[BLUEZ] Using adapter {}", adapter.name());
        Ok(Self::with_adapter(adapter))
    }

    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            resolve_timeout: Duration::from_millis(timing::CONNECT_TIMEOUT_MS),
            links: Default::default(),
        }
    }

    /// Give up on a connect whose services are not resolved within `limit`
    pub fn with_resolve_timeout(mut self, limit: Duration) -> Self {
        self.resolve_timeout = limit;
        self
    }

    fn device(&self, address: &PeripheralAddress) -> Result<Device> {
        let addr: Address = address
            .as_str()
            .parse()
            .map_err(|_| anyhow!("invalid Bluetooth address {}", address))?;
        Ok(self.adapter.device(addr)?)
    }

    fn links(&self) -> MutexGuard<'_, HashMap<PeripheralAddress, LinkEntry>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Connect and wait until GATT services are resolved
async fn establish(device: &Device) -> Result<()> {
    if !device.is_connected().await? {
        device.connect().await?;
    }
    while !device.is_services_resolved().await? {
        tokio::time::sleep(SERVICES_POLL_INTERVAL).await;
    }
    Ok(())
}

async fn write_named_descriptor(inner: &Characteristic, descriptor: Uuid, value: &[u8]) -> Result<()> {
    for d in inner.descriptors().await? {
        if d.uuid().await? == descriptor {
            d.write(value).await?;
            return Ok(());
        }
    }
    Err(anyhow!("descriptor {} not found", descriptor))
}

/// Report link loss once BlueZ marks the device disconnected
async fn watch_link(device: Device, sink: LinkSink) {
    let events = match device.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("[BLUEZ] {} cannot watch link: {}", sink.address(), e);
            return;
        }
    };
    tokio::pin!(events);

    while let Some(event) = events.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            info!("[BLUEZ] {} disconnected", sink.address());
            sink.disconnected();
            return;
        }
    }
}

#[async_trait]
impl GattTransport for BluezTransport {
    type Characteristic = BluezCharacteristic;

    async fn connect(&self, address: &PeripheralAddress, link: LinkSink, done: Completion) -> Result<()> {
        let device = self.device(address)?;
        {
            let mut links = self.links();
            let entry = links.entry(address.clone()).or_default();
            entry.abort_all();
            entry.sink = Some(link.clone());
        }

        let links = self.links.clone();
        let resolve_timeout = self.resolve_timeout;
        let key = address.clone();
        let address = address.clone();
        let task = tokio::spawn(async move {
            let established = timeout(resolve_timeout, establish(&device))
                .await
                .unwrap_or_else(|_| Err(anyhow!("services not resolved within {:?}", resolve_timeout)));
            match established {
                Ok(()) => {
                    info!("[BLUEZ] {} services resolved", address);
                    let watcher = tokio::spawn(watch_link(device, link));
                    links
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .entry(address)
                        .or_default()
                        .watcher = Some(watcher);
                    done.complete(true);
                }
                Err(e) => {
                    warn!("[BLUEZ] {} connect failed: {}", address, e);
                    done.complete(false);
                }
            }
        });

        let previous = self
            .links()
            .entry(key)
            .or_default()
            .connecting
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    async fn characteristics(
        &self,
        address: &PeripheralAddress,
    ) -> Result<CharacteristicMap<Self::Characteristic>> {
        let device = self.device(address)?;
        let mut map = HashMap::new();

        for service in device.services().await? {
            let service_uuid = service.uuid().await?;
            for inner in service.characteristics().await? {
                let handle = CharacteristicHandle::new(service_uuid, inner.uuid().await?);
                map.insert(
                    handle,
                    BluezCharacteristic {
                        address: address.clone(),
                        inner,
                    },
                );
            }
        }

        debug!("[BLUEZ] {} exposes {} characteristics", address, map.len());
        Ok(map)
    }

    async fn write_characteristic(
        &self,
        target: &Self::Characteristic,
        payload: Bytes,
        done: Completion,
    ) -> Result<()> {
        let inner = target.inner.clone();
        let address = target.address.clone();
        tokio::spawn(async move {
            let result = inner.write(&payload).await;
            if let Err(e) = &result {
                warn!("[BLUEZ] {} write failed: {}", address, e);
            }
            done.complete(result.is_ok());
        });
        Ok(())
    }

    async fn write_descriptor(
        &self,
        target: &Self::Characteristic,
        descriptor: Uuid,
        value: Bytes,
        done: Completion,
    ) -> Result<()> {
        // BlueZ owns the client configuration descriptor and writes it when
        // notifications are started or stopped
        if descriptor == gatt_uuid::CLIENT_CHARACTERISTIC_CONFIGURATION {
            done.complete(true);
            return Ok(());
        }

        let inner = target.inner.clone();
        let address = target.address.clone();
        tokio::spawn(async move {
            let result = write_named_descriptor(&inner, descriptor, &value).await;

            if let Err(e) = &result {
                warn!("[BLUEZ] {} descriptor write failed: {}", address, e);
            }
            done.complete(result.is_ok());
        });
        Ok(())
    }

    async fn set_local_notification(
        &self,
        target: &Self::Characteristic,
        handle: CharacteristicHandle,
        enable: bool,
    ) -> Result<()> {
        if !enable {
            let task = self
                .links()
                .get_mut(&target.address)
                .and_then(|entry| entry.notifications.remove(&handle));
            if let Some(task) = task {
                task.abort();
            }
            return Ok(());
        }

        let sink = self
            .links()
            .get(&target.address)
            .and_then(|entry| entry.sink.clone())
            .ok_or_else(|| anyhow!("{} is not connected", target.address))?;

        let stream = target.inner.notify().await?;
        let task = tokio::spawn(async move {
            tokio::pin!(stream);
            while let Some(value) = stream.next().await {
                sink.notify(handle, Bytes::from(value));
            }
        });

        let previous = self
            .links()
            .get_mut(&target.address)
            .and_then(|entry| entry.notifications.insert(handle, task));
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    async fn disconnect(&self, address: &PeripheralAddress) {
        let entry = self.links().remove(address);
        if let Some(mut entry) = entry {
            entry.abort_all();
        }

        match self.device(address) {
            Ok(device) => {
                if let Err(e) = device.disconnect().await {
                    debug!("[BLUEZ] {} disconnect: {}", address, e);
                }
            }
            Err(e) => warn!("[BLUEZ] {}", e),
        }
    }

    fn name(&self) -> &'static str {
        "bluez"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_abort_all_stops_pending_connect() {
        let (alive, stopped) = oneshot::channel::<()>();
        let mut entry = LinkEntry {
            connecting: Some(tokio::spawn(async move {
                let _alive = alive;
                std::future::pending::<()>().await;
            })),
            ..LinkEntry::default()
        };

        entry.abort_all();
        assert!(entry.connecting.is_none());
        // The sender is dropped once the task is torn down
        assert!(stopped.await.is_err());
    }
}
