//! Real-time connection library seam
//!
//! The connection manager drives peer connections through [`RtcEngine`]
//! and [`RtcConnection`]; the library reports back through an
//! [`RtcEventSink`] tagged with the session that owns the connection.

use crate::signaling::IceCandidate;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Identifier of one peer session; never reused within a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Which side of the negotiation this node plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    /// Creates the data channel and the offer
    Caller,
    /// Receives the offer and adopts the announced data channel
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Local or remote session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE connectivity as reported by the library
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, IceConnectionState::Connected | IceConnectionState::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Event raised by a connection on one of the library's threads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcEvent {
    IceConnectionState(IceConnectionState),
    DataChannelState(DataChannelState),
    /// Locally gathered candidate to trickle to the remote peer
    LocalCandidate(IceCandidate),
    /// Data channel message from the remote peer
    Message(Bytes),
    /// Buffered amount dropped below the low threshold
    BufferedAmountLow,
}

type Forward = dyn Fn(SessionId, RtcEvent) -> bool + Send + Sync;

/// Where a connection posts its events.
///
/// Cheap to clone; safe to call from any thread.
#[derive(Clone)]
pub struct RtcEventSink {
    session_id: SessionId,
    forward: Arc<Forward>,
}

impl RtcEventSink {
    pub fn new<F>(session_id: SessionId, forward: F) -> Self
    where
        F: Fn(SessionId, RtcEvent) -> bool + Send + Sync + 'static,
    {
        Self {
            session_id,
            forward: Arc::new(forward),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Post an event; false once the manager is gone
    pub fn emit(&self, event: RtcEvent) -> bool {
        (self.forward)(self.session_id, event)
    }
}

impl fmt::Debug for RtcEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcEventSink")
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// One peer connection with its data channel
#[async_trait]
pub trait RtcConnection: Send + Sync {
    /// Produce an offer and apply it as the local description
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    /// Produce an answer to the applied remote offer and apply it locally
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Send over the data channel; fails unless the channel is open
    async fn send(&self, payload: Bytes) -> Result<()>;

    /// Bytes queued in the data channel but not yet sent
    async fn buffered_amount(&self) -> usize;

    /// Close the data channel and the connection. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Factory for peer connections
#[async_trait]
pub trait RtcEngine: Send + Sync {
    /// Build a connection wired to `sink`.
    ///
    /// For [`CallRole::Caller`] the data channel is created eagerly; the
    /// callee receives it when the remote side announces it.
    async fn create_connection(
        &self,
        role: CallRole,
        sink: RtcEventSink,
    ) -> Result<Box<dyn RtcConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_sink_tags_events_with_session() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sink = RtcEventSink::new(SessionId::new(7), move |id, event| {
            seen_clone.lock().unwrap().push((id, event));
            true
        });

        assert!(sink.emit(RtcEvent::BufferedAmountLow));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[(SessionId::new(7), RtcEvent::BufferedAmountLow)]
        );
    }

    #[test]
    fn test_ice_state_connected() {
        assert!(IceConnectionState::Completed.is_connected());
        assert!(!IceConnectionState::Checking.is_connected());
        assert_eq!(SessionId::new(3).to_string(), "session-3");
    }
}
