//! Peripheral discovery
//!
//! This module handles:
//! - Identifying device classes from advertisement reports
//! - Tracking known peripherals and their latest advertisement
//! - Forgetting peripherals that went quiet
//! - Feeding the registry from a BlueZ scan (feature `bluez`)

mod peripheral;
mod registry;

#[cfg(feature = "bluez")]
pub mod bluez_scanner;

pub use peripheral::{Advertisement, DeviceClass, Peripheral};
pub use registry::{AdvertisementReport, DeviceRegistry, Identifier, Identify};
