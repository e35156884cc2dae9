//! Broker reconnection
//!
//! [`ReconnectPolicy`] computes backoff delays; [`ReconnectSupervisor`]
//! owns the signaling router and drives reconnects from disconnects,
//! network changes and a periodic health probe.

mod policy;
mod supervisor;

pub use policy::{ReconnectPolicy, ReconnectState};
pub use supervisor::{LinkState, PublishOutcome, ReconnectSupervisor, SupervisorHandle};
