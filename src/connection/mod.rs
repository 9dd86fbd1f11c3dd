//! Connection management for one peripheral
//!
//! This module handles:
//! - The Idle/Connecting/Connected/Disconnected lifecycle
//! - Collapsing concurrent connect requests onto one physical attempt
//! - Resolving characteristic handles against the live link
//! - Reacting to link loss and deliberate release

mod manager;

pub use manager::ConnectionManager;
