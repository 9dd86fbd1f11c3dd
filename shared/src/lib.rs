//! BLE Sequencer Shared Types
//!
//! This crate provides the peripheral-level types, the connection state
//! machine and the error kinds shared by the session engine and its
//! transport adapters.

pub mod error;
pub mod state_machine;
pub mod gatt_uuid;

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

pub use uuid::Uuid;
pub use error::{SessionError, UuidError};
pub use state_machine::{ConnectionState, ConnectionStateMachine, LinkEvent, TransitionResult};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timing parameters for the session engine
pub mod timing {
    /// How long an operation may wait for its completion signal
    pub const OPERATION_TIMEOUT_MS: u64 = 5000;

    /// How long a physical connect (handshake + discovery) may take
    pub const CONNECT_TIMEOUT_MS: u64 = 60000;

    /// Capacity of the per-session event broadcast channel
    pub const EVENT_CHANNEL_CAPACITY: usize = 64;
}

/// Client Characteristic Configuration descriptor values
pub mod cccd {
    /// Descriptor value that enables notifications
    pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

    /// Descriptor value that disables notifications and indications
    pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];
}

/// Stable identifier of a physical peripheral (its MAC address)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralAddress(String);

impl PeripheralAddress {
    /// Create an address from its textual form, normalized to upper case
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().trim().to_ascii_uppercase())
    }

    /// Build an address from raw MAC bytes
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        let text = bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":");
        Self(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeripheralAddress {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<&str> for PeripheralAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A characteristic addressed by its service and characteristic UUIDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicHandle {
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }

    /// Build a handle from full or short-form UUID strings
    ///
    /// Short forms are expanded against the Bluetooth base UUID.
    pub fn parse(service: &str, characteristic: &str) -> Result<Self, UuidError> {
        Ok(Self {
            service: gatt_uuid::expand(service)?,
            characteristic: gatt_uuid::expand(characteristic)?,
        })
    }

    /// Build a handle whose short-form UUIDs expand against a vendor base
    pub fn parse_with_base(
        base: &str,
        service: &str,
        characteristic: &str,
    ) -> Result<Self, UuidError> {
        Ok(Self {
            service: gatt_uuid::expand_with_base(base, service)?,
            characteristic: gatt_uuid::expand_with_base(base, characteristic)?,
        })
    }
}

impl fmt::Display for CharacteristicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_normalization() {
        let a = PeripheralAddress::new(" aa:bb:cc:dd:ee:ff ");
        let b = PeripheralAddress::from_bytes([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_handle_equality_by_value() {
        let h1 = CharacteristicHandle::parse("180d", "2a37").unwrap();
        let h2 = CharacteristicHandle::parse(
            "0000180D-0000-1000-8000-00805F9B34FB",
            "00002a37-0000-1000-8000-00805f9b34fb",
        )
        .unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_handle_rejects_garbage() {
        assert!(CharacteristicHandle::parse("180d", "not-a-uuid").is_err());
    }
}
