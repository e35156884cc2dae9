//! Peer session lifecycle
//!
//! The [`ConnectionManager`] owns at most one peer connection, serializes
//! every mutation through its command queue and hides the connection
//! library behind [`RtcEngine`].

pub mod engine;
pub mod manager;
pub mod queue;
#[cfg(feature = "webrtc-engine")]
pub mod webrtc;

pub use engine::{
    CallRole, DataChannelState, IceConnectionState, RtcConnection, RtcEngine, RtcEvent,
    RtcEventSink, SdpKind, SessionDescription, SessionId,
};
pub use manager::{ConnectionHandle, ConnectionManager, SendOutcome, SessionEvent, SessionStatus};
pub use queue::{BoundedQueue, FlushReport, PendingIceQueue};
#[cfg(feature = "webrtc-engine")]
pub use self::webrtc::WebRtcEngine;
