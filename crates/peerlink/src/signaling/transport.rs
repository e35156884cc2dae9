//! Pub/sub transport seam
//!
//! The router only needs topic-addressed publish, a stream of inbound
//! messages and a disconnect notification. Anything with those three
//! properties (MQTT, an in-memory broker for tests) can carry signaling.

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events produced by a live transport session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Message received on a subscribed topic
    Message { topic: String, payload: Bytes },

    /// Session ended without a local `close()`; no further events follow
    Disconnected { reason: String },
}

/// Outbound half of a transport session
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` on `topic`. Fire-and-forget: success means the
    /// transport accepted the message, not that anyone received it.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Tear down the session; calling it twice is harmless
    async fn close(&self) -> Result<()>;
}

/// A connected session: publisher plus inbound event stream
pub struct TransportLink {
    pub publisher: Arc<dyn Publisher>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink").finish_non_exhaustive()
    }
}

/// Factory for transport sessions.
///
/// Each `connect` call opens a brand new session; the reconnect supervisor
/// calls it again after every disconnect.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and subscribe to `subscriptions`.
    ///
    /// Returns once the session is established. Implementations must not
    /// retry internally; retry policy belongs to the caller.
    async fn connect(&self, subscriptions: &[String]) -> Result<TransportLink>;
}
