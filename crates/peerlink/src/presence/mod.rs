//! Peer presence tracking
//!
//! Every node publishes a heartbeat on the shared signaling topic. The
//! registry records the last heartbeat per peer and ages silent peers from
//! Online to Stale and finally removes them.

mod registry;

pub use registry::{PresenceEntry, PresenceEvent, PresenceRegistry, PresenceState};
