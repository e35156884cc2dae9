//! Peer-to-peer session coordination over a pub/sub rendezvous bus
//!
//! Two devices find each other through presence heartbeats on a shared
//! topic, exchange offers, answers and ICE candidates over the same topic,
//! and then talk directly over a data channel. The bus carries no trust and
//! no state; this crate is the coordination layer that keeps the peer
//! session consistent while the bus reorders, drops and disconnects.
//!
//! # Features
//!
//! - **Presence**: online, stale and expired peers derived from heartbeats
//! - **Signaling**: typed JSON envelopes addressed by peer id
//! - **Session lifecycle**: one peer session at a time, with early ICE
//!   candidates and outbound messages held until they can be applied
//! - **Reconnect supervision**: exponential backoff, forced reconnect on
//!   network change, health probe, telemetry outbox replay
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  PeerNode (glue task, NodeEvent stream)               │
//! │  ├─ ReconnectSupervisor (owns the router's link)      │
//! │  │   └─ SignalingRouter ── Transport (MQTT)           │
//! │  │        ├─ heartbeat ─▶ bus                         │
//! │  │        └─ presence ─▶ PresenceRegistry             │
//! │  └─ ConnectionManager (single-writer session actor)   │
//! │       └─ RtcEngine (webrtc-rs)                        │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use peerlink::PeerLinkConfig;
//!
//! let config = PeerLinkConfig::mobile_network_preset("broker.example.com")
//!     .with_peer_id("peer_demo");
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.signaling_topic, "webrtc/signaling");
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use peerlink::{MqttTransport, PeerId, PeerLinkConfig, PeerNode, WebRtcEngine};
//! use std::sync::Arc;
//!
//! # async fn example() -> peerlink::Result<()> {
//! let config = PeerLinkConfig::default().with_peer_id("peer_demo");
//! let transport = MqttTransport::new(config.broker.clone(), &PeerId::new("peer_demo"));
//! let engine = WebRtcEngine::new(config.ice_servers.clone(), config.session.clone());
//!
//! let (node, mut events) = PeerNode::start(config, Arc::new(transport), Arc::new(engine))?;
//! node.call(PeerId::new("peer_other")).await?;
//! node.send_message("hello").await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod node;
pub mod peer_id;
pub mod presence;
pub mod reconnect;
pub mod session;
pub mod signaling;

/// In-memory broker and loopback engine for tests
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{
    BrokerConfig, IceServerConfig, PeerLinkConfig, PresenceConfig, ReconnectConfig, SessionConfig,
};
pub use error::{Error, Result};
pub use node::{NodeEvent, PeerNode};
pub use peer_id::PeerId;
pub use presence::{PresenceEntry, PresenceEvent, PresenceRegistry, PresenceState};
pub use reconnect::{
    LinkState, PublishOutcome, ReconnectPolicy, ReconnectState, ReconnectSupervisor,
    SupervisorHandle,
};
pub use session::{
    CallRole, ConnectionHandle, ConnectionManager, DataChannelState, IceConnectionState,
    SendOutcome, SessionEvent, SessionId, SessionStatus,
};
pub use signaling::{
    IceCandidate, InboundSignal, SignalPayload, SignalingEnvelope, SignalingRouter, Transport,
};

#[cfg(feature = "mqtt")]
pub use signaling::MqttTransport;
#[cfg(feature = "webrtc-engine")]
pub use session::WebRtcEngine;

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
