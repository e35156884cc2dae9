//! Error types for peerlink

/// Result type alias using the peerlink Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating peer sessions
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Pub/sub transport failure (broker unreachable, socket reset, publish failed)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Signaling link is not connected
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// SDP negotiation error (offer/answer/remote description)
    #[error("SDP negotiation error: {0}")]
    Sdp(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidate(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannel(String),

    /// Peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    /// Operation needs a live session but none exists
    #[error("No active session")]
    NoActiveSession,

    /// Operation targeted a session that has since been replaced or closed
    #[error("Stale session: {0}")]
    StaleSession(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// The component task behind a handle has stopped
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is recovered by retrying (reconnect or new attempt)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::NotConnected(_)
                | Error::OperationTimeout(_)
                | Error::Io(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error belongs to the peer session (negotiation, ICE, channel)
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            Error::Sdp(_)
                | Error::IceCandidate(_)
                | Error::DataChannel(_)
                | Error::PeerConnection(_)
                | Error::NoActiveSession
                | Error::StaleSession(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
