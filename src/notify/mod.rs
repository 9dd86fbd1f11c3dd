//! Notification delivery for subscribed characteristics

mod router;

pub use router::{NotificationRouter, Subscription};
