//! Rendezvous signaling over a shared pub/sub topic
//!
//! - [`envelope`]: JSON wire format for presence, offer, answer and ICE messages
//! - [`transport`]: the pub/sub seam ([`Transport`], [`Publisher`])
//! - [`mqtt`]: MQTT implementation of the seam
//! - [`router`]: heartbeat publication and inbound dispatch

pub mod envelope;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod router;
pub mod transport;

pub use envelope::{EnvelopeError, IceCandidate, SignalKind, SignalPayload, SignalingEnvelope};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;
pub use router::{InboundSignal, LinkLost, SignalSender, SignalingRouter};
pub use transport::{Publisher, Transport, TransportEvent, TransportLink};
