//! Per-peripheral sessions
//!
//! A session serializes every operation aimed at one peripheral: batches
//! queue up in submission order and a single task executes them one
//! operation at a time against the session's connection.

mod events;
mod manager;
#[allow(clippy::module_inception)]
mod session;

pub use events::SessionEvent;
pub use manager::{SessionConfig, SessionManager};
pub use session::Session;
