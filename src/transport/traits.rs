//! Transport trait abstraction for pluggable GATT backends

use super::LinkSink;
use crate::command::Completion;
use anyhow::Result;
use async_trait::async_trait;
use ble_sequencer_shared::{CharacteristicHandle, PeripheralAddress, Uuid};
use bytes::Bytes;
use std::collections::HashMap;

/// Characteristics exposed by a connected peripheral
pub type CharacteristicMap<C> = HashMap<CharacteristicHandle, C>;

/// A GATT client backend
///
/// Request methods only dispatch: they return once the request has been
/// handed to the stack and report the outcome later through `done`,
/// possibly from another thread. An `Err` means the request was never
/// accepted, in which case `done` may simply be dropped.
#[async_trait]
pub trait GattTransport: Send + Sync + 'static {
    /// The backend's reference to a discovered characteristic
    type Characteristic: Clone + Send + Sync + 'static;

    /// Start a physical connect
    ///
    /// `done` completes with `true` once the handshake and service
    /// discovery have finished. Unsolicited events for this link are
    /// reported through `link` for as long as it stays up.
    async fn connect(&self, address: &PeripheralAddress, link: LinkSink, done: Completion)
        -> Result<()>;

    /// Characteristic map of a connected peripheral
    async fn characteristics(
        &self,
        address: &PeripheralAddress,
    ) -> Result<CharacteristicMap<Self::Characteristic>>;

    /// Write a characteristic value
    async fn write_characteristic(
        &self,
        target: &Self::Characteristic,
        payload: Bytes,
        done: Completion,
    ) -> Result<()>;

    /// Write a descriptor of a characteristic
    async fn write_descriptor(
        &self,
        target: &Self::Characteristic,
        descriptor: Uuid,
        value: Bytes,
        done: Completion,
    ) -> Result<()>;

    /// Toggle local delivery of notifications for a characteristic
    ///
    /// Synchronous from the caller's point of view: no completion follows.
    async fn set_local_notification(
        &self,
        target: &Self::Characteristic,
        handle: CharacteristicHandle,
        enable: bool,
    ) -> Result<()>;

    /// Release the physical link; fire-and-forget
    async fn disconnect(&self, address: &PeripheralAddress);

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
