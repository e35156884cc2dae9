//! Signaling router
//!
//! Owns one transport session at a time. While connected it publishes the
//! local presence heartbeat and demultiplexes inbound envelopes: presence
//! goes to the [`PresenceRegistry`], offers/answers/candidates addressed to
//! the local peer go to the session glue as [`InboundSignal`]s.
//!
//! Only the reconnect supervisor connects or disconnects the router. Every
//! other component holds a [`SignalSender`].

use super::envelope::{IceCandidate, SignalPayload, SignalingEnvelope};
use super::transport::{Publisher, Transport, TransportEvent};
use crate::config::PeerLinkConfig;
use crate::peer_id::PeerId;
use crate::presence::PresenceRegistry;
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Signal addressed to the local peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundSignal {
    Offer {
        from: PeerId,
        sdp: String,
        ice_restart: bool,
    },
    Answer {
        from: PeerId,
        sdp: String,
    },
    IceCandidate {
        from: PeerId,
        candidate: IceCandidate,
    },
}

impl InboundSignal {
    pub fn from_peer(&self) -> &PeerId {
        match self {
            InboundSignal::Offer { from, .. }
            | InboundSignal::Answer { from, .. }
            | InboundSignal::IceCandidate { from, .. } => from,
        }
    }
}

/// Current transport session, shared between the router and its senders
#[derive(Default)]
struct LinkSlot {
    generation: u64,
    publisher: Option<Arc<dyn Publisher>>,
    healthy: bool,
}

type SharedSlot = Arc<Mutex<LinkSlot>>;

fn current_publisher(slot: &SharedSlot) -> Result<(u64, Arc<dyn Publisher>)> {
    let slot = slot.lock();
    slot.publisher
        .clone()
        .map(|publisher| (slot.generation, publisher))
        .ok_or_else(|| Error::NotConnected("signaling link is down".to_string()))
}

fn mark_unhealthy(slot: &SharedSlot, generation: u64) {
    let mut slot = slot.lock();
    if slot.generation == generation {
        slot.healthy = false;
    }
}

/// Cloneable send-only handle to the signaling link
#[derive(Clone)]
pub struct SignalSender {
    local_peer_id: PeerId,
    topic: String,
    slot: SharedSlot,
}

impl SignalSender {
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Publish an envelope from the local peer to `to`.
    ///
    /// Fire-and-forget; fails only when the link is down or the transport
    /// rejects the publish.
    pub async fn send(&self, to: &PeerId, payload: SignalPayload) -> Result<()> {
        let envelope = SignalingEnvelope::new(self.local_peer_id.clone(), to.clone(), payload);
        debug!(to = %to, kind = ?envelope.kind(), "Sending signal");
        let bytes = envelope.to_bytes()?;
        self.publish_raw(&self.topic, Bytes::from(bytes)).await
    }

    /// Publish arbitrary bytes on any topic over the current link
    pub async fn publish_raw(&self, topic: &str, payload: Bytes) -> Result<()> {
        let (generation, publisher) = current_publisher(&self.slot)?;
        let result = publisher.publish(topic, payload).await;
        if let Err(e) = &result {
            if e.is_retryable() {
                mark_unhealthy(&self.slot, generation);
            }
        }
        result
    }

    pub fn is_connected(&self) -> bool {
        let slot = self.slot.lock();
        slot.publisher.is_some() && slot.healthy
    }
}

/// Resolves with the reason when the transport drops the session.
///
/// Also resolves if the router is disconnected or dropped.
pub struct LinkLost {
    rx: oneshot::Receiver<String>,
}

impl Future for LinkLost {
    type Output = String;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reason| reason.unwrap_or_else(|_| "signaling link closed".to_string()))
    }
}

/// Presence heartbeat and inbound dispatch over a pub/sub transport
pub struct SignalingRouter {
    local_peer_id: PeerId,
    topic: String,
    heartbeat_interval: Duration,
    connect_timeout: Duration,
    transport: Arc<dyn Transport>,
    registry: PresenceRegistry,
    inbound_tx: mpsc::UnboundedSender<InboundSignal>,
    slot: SharedSlot,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingRouter {
    /// Create a disconnected router; inbound signals arrive on the returned receiver
    pub fn new(
        local_peer_id: PeerId,
        config: &PeerLinkConfig,
        transport: Arc<dyn Transport>,
        registry: PresenceRegistry,
    ) -> (Self, mpsc::UnboundedReceiver<InboundSignal>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let router = Self {
            local_peer_id,
            topic: config.signaling_topic.clone(),
            heartbeat_interval: config.presence.heartbeat_interval(),
            connect_timeout: config.broker.connect_timeout(),
            transport,
            registry,
            inbound_tx,
            slot: Arc::new(Mutex::new(LinkSlot::default())),
            tasks: Vec::new(),
        };
        (router, inbound_rx)
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    pub fn sender(&self) -> SignalSender {
        SignalSender {
            local_peer_id: self.local_peer_id.clone(),
            topic: self.topic.clone(),
            slot: self.slot.clone(),
        }
    }

    /// Connected and no publish has failed since
    pub fn is_connected(&self) -> bool {
        let slot = self.slot.lock();
        slot.publisher.is_some() && slot.healthy
    }

    /// Open a transport session, subscribe to the signaling topic and start
    /// the heartbeat.
    ///
    /// Any previous session is torn down first. The returned [`LinkLost`]
    /// resolves when the transport reports a disconnect.
    pub async fn connect(&mut self) -> Result<LinkLost> {
        self.disconnect().await;

        let subscriptions = [self.topic.clone()];
        let link = tokio::time::timeout(self.connect_timeout, self.transport.connect(&subscriptions))
            .await
            .map_err(|_| Error::OperationTimeout("signaling connect timed out".to_string()))??;

        let generation = {
            let mut slot = self.slot.lock();
            slot.generation += 1;
            slot.publisher = Some(link.publisher);
            slot.healthy = true;
            slot.generation
        };

        let (lost_tx, lost_rx) = oneshot::channel();

        let pump = InboundPump {
            local_peer_id: self.local_peer_id.clone(),
            topic: self.topic.clone(),
            registry: self.registry.clone(),
            inbound_tx: self.inbound_tx.clone(),
        };
        let slot = self.slot.clone();
        let mut events = link.events;
        self.tasks.push(tokio::spawn(async move {
            let reason = loop {
                match events.recv().await {
                    Some(TransportEvent::Message { topic, payload }) => pump.handle(&topic, &payload),
                    Some(TransportEvent::Disconnected { reason }) => break reason,
                    None => break "transport event stream ended".to_string(),
                }
            };
            warn!("Signaling link lost: {}", reason);
            {
                let mut slot = slot.lock();
                if slot.generation == generation {
                    slot.publisher = None;
                    slot.healthy = false;
                }
            }
            let _ = lost_tx.send(reason);
        }));

        self.tasks.push(self.spawn_heartbeat());

        info!(peer_id = %self.local_peer_id, topic = %self.topic, "Signaling connected");
        Ok(LinkLost { rx: lost_rx })
    }

    /// Stop the heartbeat and close the transport session. Idempotent.
    pub async fn disconnect(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }

        let publisher = {
            let mut slot = self.slot.lock();
            slot.healthy = false;
            slot.publisher.take()
        };

        if let Some(publisher) = publisher {
            if let Err(e) = publisher.close().await {
                debug!("Error closing transport session: {}", e);
            }
            info!(peer_id = %self.local_peer_id, "Signaling disconnected");
        }
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let sender = self.sender();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let presence = match SignalingEnvelope::presence(sender.local_peer_id.clone()).to_bytes() {
                Ok(bytes) => Bytes::from(bytes),
                Err(e) => {
                    warn!("Failed to encode presence heartbeat: {}", e);
                    return;
                }
            };
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = sender.publish_raw(&sender.topic, presence.clone()).await {
                    debug!("Heartbeat publish failed: {}", e);
                }
            }
        })
    }
}

impl Drop for SignalingRouter {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Demultiplexes raw transport messages
struct InboundPump {
    local_peer_id: PeerId,
    topic: String,
    registry: PresenceRegistry,
    inbound_tx: mpsc::UnboundedSender<InboundSignal>,
}

impl InboundPump {
    fn handle(&self, topic: &str, payload: &[u8]) {
        if topic != self.topic {
            trace!("Ignoring message on {}", topic);
            return;
        }

        let envelope = match SignalingEnvelope::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed signaling message: {}", e);
                return;
            }
        };

        if envelope.from == self.local_peer_id {
            return;
        }

        let from = envelope.from;
        let signal = match envelope.payload {
            SignalPayload::Presence => {
                self.registry.update(&from);
                return;
            }
            _ if envelope.to.as_ref() != Some(&self.local_peer_id) => {
                trace!(from = %from, "Signal addressed to another peer");
                return;
            }
            SignalPayload::Offer { sdp, ice_restart } => InboundSignal::Offer {
                from,
                sdp,
                ice_restart,
            },
            SignalPayload::Answer { sdp } => InboundSignal::Answer { from, sdp },
            SignalPayload::Ice(candidate) => InboundSignal::IceCandidate { from, candidate },
        };

        debug!(from = %signal.from_peer(), "Received signal");
        if self.inbound_tx.send(signal).is_err() {
            debug!("Inbound signal receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceState;
    use crate::testing::MemoryBroker;

    fn config() -> PeerLinkConfig {
        PeerLinkConfig::default()
    }

    fn router(broker: &MemoryBroker, id: &str) -> (SignalingRouter, mpsc::UnboundedReceiver<InboundSignal>, PresenceRegistry) {
        let registry = PresenceRegistry::new(&config().presence);
        let (router, rx) = SignalingRouter::new(
            PeerId::new(id),
            &config(),
            Arc::new(broker.clone()),
            registry.clone(),
        );
        (router, rx, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_populate_remote_registry() {
        let broker = MemoryBroker::new();
        let (mut a, _a_rx, a_registry) = router(&broker, "peer_a");
        let (mut b, _b_rx, b_registry) = router(&broker, "peer_b");

        a.connect().await.unwrap();
        b.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(b_registry.state_of(&PeerId::new("peer_a")), Some(PresenceState::Online));
        assert_eq!(a_registry.state_of(&PeerId::new("peer_b")), Some(PresenceState::Online));
        // Own heartbeats are echoed by the broker but never listed
        assert!(a_registry.state_of(&PeerId::new("peer_a")).is_none());
    }

    #[tokio::test]
    async fn test_dispatches_only_signals_addressed_to_us() {
        let broker = MemoryBroker::new();
        let (mut a, mut a_rx, _) = router(&broker, "peer_a");
        let (mut b, _b_rx, _) = router(&broker, "peer_b");
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        let sender = b.sender();
        sender
            .send(&PeerId::new("peer_c"), SignalPayload::Answer { sdp: "ignored".to_string() })
            .await
            .unwrap();
        sender
            .send(&PeerId::new("peer_a"), SignalPayload::Answer { sdp: "v=0".to_string() })
            .await
            .unwrap();

        let signal = a_rx.recv().await.unwrap();
        assert_eq!(
            signal,
            InboundSignal::Answer {
                from: PeerId::new("peer_b"),
                sdp: "v=0".to_string()
            }
        );
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_messages_are_dropped() {
        let broker = MemoryBroker::new();
        let (mut a, mut a_rx, _) = router(&broker, "peer_a");
        a.connect().await.unwrap();

        broker.inject("webrtc/signaling", Bytes::from_static(b"{\"type\":\"offer\""));
        broker.inject(
            "webrtc/signaling",
            Bytes::from_static(br#"{"type":"offer","from":"peer_b","to":"peer_a","data":{"sdp":"v=0"}}"#),
        );

        let signal = a_rx.recv().await.unwrap();
        assert!(matches!(signal, InboundSignal::Offer { ice_restart: false, .. }));
    }

    #[tokio::test]
    async fn test_link_lost_resolves_on_broker_drop() {
        let broker = MemoryBroker::new();
        let (mut a, _rx, _) = router(&broker, "peer_a");
        let mut lost = tokio_test::task::spawn(a.connect().await.unwrap());
        assert!(a.is_connected());
        tokio_test::assert_pending!(lost.poll());

        broker.drop_all_sessions("broker restarted");
        while !lost.is_woken() {
            tokio::task::yield_now().await;
        }
        tokio_test::assert_ready_eq!(lost.poll(), "broker restarted".to_string());
        assert!(!a.is_connected());
        assert!(a.sender().send(&PeerId::new("peer_b"), SignalPayload::Presence).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let broker = MemoryBroker::new();
        let (mut a, _rx, _) = router(&broker, "peer_a");
        a.connect().await.unwrap();
        assert_eq!(broker.session_count(), 1);

        a.disconnect().await;
        a.disconnect().await;
        assert_eq!(broker.session_count(), 0);
        assert!(!a.is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure_is_retryable() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let (mut a, _rx, _) = router(&broker, "peer_a");

        let err = a.connect().await.err().unwrap();
        assert!(err.is_retryable());
        assert!(!a.is_connected());
    }

    #[tokio::test]
    async fn test_failed_publish_marks_link_unhealthy() {
        let broker = MemoryBroker::new();
        let (mut a, _rx, _) = router(&broker, "peer_a");
        a.connect().await.unwrap();

        broker.set_publish_failing(true);
        assert!(a.sender().publish_raw("gps/demo/nmea", Bytes::from_static(b"$GPGGA")).await.is_err());
        assert!(!a.is_connected());
    }
}
