pub mod link;
pub mod scripted;
pub mod traits;

#[cfg(feature = "bluez")]
pub mod bluez;

pub use link::{LinkObserver, LinkSink};
pub use traits::{CharacteristicMap, GattTransport};
