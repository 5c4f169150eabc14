//! Cross-device room broadcast for tally.
//!
//! Devices in the same room exchange `vote` and `reset` signals over Redis
//! Pub/Sub. Delivery is best-effort: messages published while a device is
//! disconnected are never seen by it, and the reconciler's poll covers the
//! gap.

pub mod pubsub;

pub use pubsub::{RedisPubSub, room_channel};
