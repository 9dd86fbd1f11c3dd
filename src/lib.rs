//! BLE action sequencer
//!
//! Turns batches of high-level peripheral operations (connect, write a
//! characteristic, toggle notifications) into a strictly ordered,
//! timeout-bounded execution against one live connection per peripheral.

pub mod command;
pub mod connection;
pub mod discovery;
pub mod notify;
pub mod session;
pub mod transport;

pub use ble_sequencer_shared as shared;
pub use ble_sequencer_shared::{
    CharacteristicHandle, ConnectionState, PeripheralAddress, SessionError, Uuid,
};
pub use command::{Batch, BatchBuilder, BatchFailure, BatchId, Operation, OperationKind};
pub use discovery::{AdvertisementReport, DeviceClass, DeviceRegistry, Identify, Peripheral};
pub use notify::{NotificationRouter, Subscription};
pub use session::{Session, SessionConfig, SessionEvent, SessionManager};
pub use transport::{CharacteristicMap, GattTransport, LinkSink};
