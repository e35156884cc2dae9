//! Peer node: one process's presence, signaling, session and reconnect
//! components wired together
//!
//! [`PeerNode::start`] takes the transport and connection engine as
//! arguments so tests can swap in the in-memory doubles. A glue task routes
//! inbound signals to the connection manager and outbound session events
//! back through the router, and forwards everything observable to the
//! application as [`NodeEvent`]s.

use crate::config::PeerLinkConfig;
use crate::peer_id::PeerId;
use crate::presence::{PresenceEntry, PresenceEvent, PresenceRegistry};
use crate::reconnect::{LinkState, PublishOutcome, ReconnectSupervisor, SupervisorHandle};
use crate::session::{
    BoundedQueue, CallRole, ConnectionHandle, ConnectionManager, RtcEngine, SendOutcome,
    SessionDescription, SessionEvent, SessionId, SessionStatus,
};
use crate::signaling::{
    IceCandidate, InboundSignal, SignalPayload, SignalSender, SignalingRouter, Transport,
};
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Candidates held per sender while its offer is still in flight
const EARLY_CANDIDATE_CAPACITY: usize = 32;

/// Held candidates older than this are forgotten
const EARLY_CANDIDATE_MAX_AGE: Duration = Duration::from_secs(30);

/// Everything the application can observe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Session(SessionEvent),
    Presence(PresenceEvent),
    Link(LinkState),
}

enum NodeCommand {
    Call {
        target: PeerId,
        reply: oneshot::Sender<Result<SessionId>>,
    },
    HangUp {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A running peer
pub struct PeerNode {
    local_peer_id: PeerId,
    registry: PresenceRegistry,
    connections: ConnectionHandle,
    supervisor: SupervisorHandle,
    commands: mpsc::UnboundedSender<NodeCommand>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerNode {
    /// Validate `config`, start every component and begin connecting
    pub fn start(
        config: PeerLinkConfig,
        transport: Arc<dyn Transport>,
        engine: Arc<dyn RtcEngine>,
    ) -> Result<(PeerNode, mpsc::UnboundedReceiver<NodeEvent>)> {
        config.validate()?;

        let local_peer_id = config
            .peer_id
            .clone()
            .map(PeerId::new)
            .unwrap_or_else(PeerId::random);
        info!(peer_id = %local_peer_id, "Starting peer node");

        let registry = PresenceRegistry::new(&config.presence);
        let ticker = registry.spawn_ticker(config.presence.tick_interval());

        let (router, inbound) =
            SignalingRouter::new(local_peer_id.clone(), &config, transport, registry.clone());
        let sender = router.sender();

        let (connections, session_events) =
            ConnectionManager::spawn(engine, config.session.clone());
        let supervisor = ReconnectSupervisor::spawn(router, &config, Some(connections.clone()));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let glue = Glue {
            local_peer_id: local_peer_id.clone(),
            sender,
            connections: connections.clone(),
            active: None,
            early_candidates: EarlyCandidates::new(
                EARLY_CANDIDATE_CAPACITY,
                EARLY_CANDIDATE_MAX_AGE,
            ),
            events: events_tx,
        };
        let glue_task = tokio::spawn(glue.run(
            command_rx,
            inbound,
            session_events,
            registry.subscribe(),
            supervisor.link_state(),
        ));

        let node = PeerNode {
            local_peer_id,
            registry,
            connections,
            supervisor,
            commands,
            tasks: vec![ticker, glue_task],
        };
        Ok((node, events_rx))
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Known peers, never including this node
    pub fn peers(&self) -> BTreeMap<PeerId, PresenceEntry> {
        self.registry.snapshot(Some(&self.local_peer_id))
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceEvent> {
        self.registry.subscribe()
    }

    /// Forget a peer until its next heartbeat
    pub fn remove_peer(&self, peer_id: &PeerId) -> bool {
        self.registry.remove(peer_id)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> NodeCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| Error::ChannelClosed("peer node stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::ChannelClosed("peer node dropped request".to_string()))
    }

    /// Select `target`: close any current session, start a caller session
    /// and send the offer
    pub async fn call(&self, target: PeerId) -> Result<SessionId> {
        self.request(|reply| NodeCommand::Call { target, reply })
            .await?
    }

    /// Send on the data channel, queueing until it opens
    pub async fn send_message(&self, payload: impl Into<Bytes>) -> Result<SendOutcome> {
        self.connections.send_message(payload).await
    }

    pub async fn hang_up(&self) -> Result<()> {
        self.request(|reply| NodeCommand::HangUp { reply }).await
    }

    pub async fn session_status(&self) -> Result<Option<SessionStatus>> {
        self.connections.status().await
    }

    pub fn network_available(&self, network_id: impl Into<String>) -> Result<()> {
        self.supervisor.network_available(network_id)
    }

    pub fn network_lost(&self, network_id: impl Into<String>) -> Result<()> {
        self.supervisor.network_lost(network_id)
    }

    /// Publish on the telemetry topic, holding the payload while offline
    pub async fn publish_telemetry(&self, payload: impl Into<Bytes>) -> Result<PublishOutcome> {
        self.supervisor.publish(payload).await
    }

    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.supervisor.link_state()
    }

    /// Close the session, disconnect and stop every task
    pub async fn shutdown(mut self) -> Result<()> {
        info!(peer_id = %self.local_peer_id, "Shutting down peer node");
        let _ = self.request(|reply| NodeCommand::Shutdown { reply }).await;
        self.supervisor.shutdown().await?;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for PeerNode {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct ActiveCall {
    peer: PeerId,
    session_id: SessionId,
}

/// Remote candidates from peers we have no session with yet, keyed by
/// sender. Signals can overtake each other on the bus, so a callee may see
/// candidates before the offer they belong to.
struct EarlyCandidates {
    by_peer: HashMap<PeerId, HeldCandidates>,
    capacity: usize,
    max_age: Duration,
}

struct HeldCandidates {
    last_seen: Instant,
    queue: BoundedQueue<IceCandidate>,
}

impl EarlyCandidates {
    fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            by_peer: HashMap::new(),
            capacity,
            max_age,
        }
    }

    fn hold(&mut self, from: PeerId, candidate: IceCandidate) {
        self.expire();
        let capacity = self.capacity;
        let held = self.by_peer.entry(from).or_insert_with(|| HeldCandidates {
            last_seen: Instant::now(),
            queue: BoundedQueue::new(capacity),
        });
        held.last_seen = Instant::now();
        held.queue.push(candidate);
    }

    /// Everything held for `peer`, oldest first; all other senders are
    /// forgotten
    fn take(&mut self, peer: &PeerId) -> Vec<IceCandidate> {
        self.expire();
        let mut taken = Vec::new();
        if let Some(mut held) = self.by_peer.remove(peer) {
            taken.extend(held.queue.drain());
        }
        self.by_peer.clear();
        taken
    }

    fn clear(&mut self) {
        self.by_peer.clear();
    }

    fn len(&self) -> usize {
        self.by_peer.values().map(|held| held.queue.len()).sum()
    }

    fn expire(&mut self) {
        let max_age = self.max_age;
        let now = Instant::now();
        self.by_peer
            .retain(|_, held| now.duration_since(held.last_seen) < max_age);
    }
}

struct Glue {
    local_peer_id: PeerId,
    sender: SignalSender,
    connections: ConnectionHandle,
    active: Option<ActiveCall>,
    early_candidates: EarlyCandidates,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl Glue {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<NodeCommand>,
        mut inbound: mpsc::UnboundedReceiver<InboundSignal>,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
        mut presence: broadcast::Receiver<PresenceEvent>,
        mut link: watch::Receiver<LinkState>,
    ) {
        let mut presence_open = true;
        let mut link_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(NodeCommand::Call { target, reply }) => {
                            let _ = reply.send(self.call(target).await);
                        }
                        Some(NodeCommand::HangUp { reply }) => {
                            self.hang_up().await;
                            let _ = reply.send(());
                        }
                        Some(NodeCommand::Shutdown { reply }) => {
                            let _ = self.connections.shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                        None => break,
                    }
                }
                Some(signal) = inbound.recv() => {
                    self.on_signal(signal).await;
                }
                Some(event) = session_events.recv() => {
                    self.on_session_event(event).await;
                }
                result = presence.recv(), if presence_open => {
                    match result {
                        Ok(event) => self.emit(NodeEvent::Presence(event)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Presence listener lagged, skipped {} events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => presence_open = false,
                    }
                }
                changed = link.changed(), if link_open => {
                    if changed.is_err() {
                        link_open = false;
                    } else {
                        let state = *link.borrow_and_update();
                        self.emit(NodeEvent::Link(state));
                    }
                }
            }
        }
        debug!("Peer node glue task stopped");
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    fn is_active_peer(&self, peer: &PeerId) -> bool {
        self.active.as_ref().map(|a| &a.peer == peer).unwrap_or(false)
    }

    fn is_active_session(&self, session_id: SessionId) -> bool {
        self.active
            .as_ref()
            .map(|a| a.session_id == session_id)
            .unwrap_or(false)
    }

    async fn call(&mut self, target: PeerId) -> Result<SessionId> {
        if target == self.local_peer_id {
            return Err(Error::PeerConnection("cannot call the local peer".to_string()));
        }

        info!(target = %target, "Calling peer");
        self.early_candidates.clear();
        let session_id = self
            .connections
            .create_session(CallRole::Caller, target.clone())
            .await?;
        self.active = Some(ActiveCall {
            peer: target.clone(),
            session_id,
        });

        let offer = self.connections.create_offer(session_id).await?;
        self.sender
            .send(
                &target,
                SignalPayload::Offer {
                    sdp: offer.sdp,
                    ice_restart: false,
                },
            )
            .await?;
        Ok(session_id)
    }

    async fn hang_up(&mut self) {
        self.active = None;
        if let Err(e) = self.connections.close().await {
            warn!("Failed to close session: {}", e);
        }
    }

    async fn on_signal(&mut self, signal: InboundSignal) {
        match signal {
            InboundSignal::Offer {
                from,
                sdp,
                ice_restart,
            } => {
                let result = match &self.active {
                    Some(active) if ice_restart && active.peer == from => {
                        let session_id = active.session_id;
                        debug!(from = %from, "Renegotiating for ICE restart");
                        self.answer(session_id, &from, sdp).await
                    }
                    _ => self.accept_offer(from.clone(), sdp).await,
                };
                if let Err(e) = result {
                    warn!(from = %from, "Failed to answer offer: {}", e);
                }
            }
            InboundSignal::Answer { from, sdp } => {
                let Some(session_id) = self.session_for(&from) else {
                    debug!(from = %from, "Dropping answer from peer without a session");
                    return;
                };
                if let Err(e) = self
                    .connections
                    .set_remote_description(session_id, SessionDescription::answer(sdp))
                    .await
                {
                    warn!(from = %from, "Failed to apply answer: {}", e);
                }
            }
            InboundSignal::IceCandidate { from, candidate } => {
                let Some(session_id) = self.session_for(&from) else {
                    self.early_candidates.hold(from.clone(), candidate);
                    trace!(
                        from = %from,
                        "Holding candidate until an offer arrives ({} held)",
                        self.early_candidates.len()
                    );
                    return;
                };
                if let Err(e) = self.connections.add_ice_candidate(session_id, candidate).await {
                    warn!(from = %from, "Failed to add remote candidate: {}", e);
                }
            }
        }
    }

    fn session_for(&self, peer: &PeerId) -> Option<SessionId> {
        self.active
            .as_ref()
            .filter(|active| &active.peer == peer)
            .map(|active| active.session_id)
    }

    /// Replace any session with a callee session for `from`, then answer.
    ///
    /// Candidates `from` sent ahead of the offer go into the new session's
    /// pending queue first, in arrival order.
    async fn accept_offer(&mut self, from: PeerId, sdp: String) -> Result<()> {
        info!(from = %from, "Accepting offer");
        self.active = None;
        let early = self.early_candidates.take(&from);
        let session_id = self
            .connections
            .create_session(CallRole::Callee, from.clone())
            .await?;
        self.active = Some(ActiveCall {
            peer: from.clone(),
            session_id,
        });

        if !early.is_empty() {
            debug!(from = %from, "Replaying {} candidates received before the offer", early.len());
        }
        for candidate in early {
            self.connections.add_ice_candidate(session_id, candidate).await?;
        }
        self.answer(session_id, &from, sdp).await
    }

    async fn answer(&mut self, session_id: SessionId, to: &PeerId, sdp: String) -> Result<()> {
        self.connections
            .set_remote_description(session_id, SessionDescription::offer(sdp))
            .await?;
        let answer = self.connections.create_answer(session_id).await?;
        self.sender
            .send(to, SignalPayload::Answer { sdp: answer.sdp })
            .await
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match &event {
            SessionEvent::LocalCandidate {
                session_id,
                to,
                candidate,
            } if self.is_active_session(*session_id) => {
                if let Err(e) = self.sender.send(to, SignalPayload::Ice(candidate.clone())).await {
                    debug!(to = %to, "Failed to send local candidate: {}", e);
                }
            }
            SessionEvent::RestartOffer {
                session_id,
                to,
                sdp,
            } if self.is_active_session(*session_id) => {
                let payload = SignalPayload::Offer {
                    sdp: sdp.clone(),
                    ice_restart: true,
                };
                if let Err(e) = self.sender.send(to, payload).await {
                    warn!(to = %to, "Failed to send ICE restart offer: {}", e);
                }
            }
            SessionEvent::Closed { session_id, peer } | SessionEvent::Failed { session_id, peer, .. }
                if self.is_active_session(*session_id) && self.is_active_peer(peer) =>
            {
                self.active = None;
            }
            _ => {}
        }
        self.emit(NodeEvent::Session(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{LoopbackEngine, MemoryBroker};

    fn config(peer: &str) -> PeerLinkConfig {
        PeerLinkConfig::default().with_peer_id(peer)
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut config = config("peer_a");
        config.signaling_topic.clear();
        let result = PeerNode::start(
            config,
            Arc::new(MemoryBroker::new()),
            Arc::new(LoopbackEngine::new()),
        );
        assert!(matches!(result, Err(e) if e.is_config_error()));
    }

    #[tokio::test]
    async fn test_uses_configured_peer_id() {
        let (node, _events) = PeerNode::start(
            config("peer_a"),
            Arc::new(MemoryBroker::new()),
            Arc::new(LoopbackEngine::new()),
        )
        .unwrap();
        assert_eq!(node.local_peer_id().as_str(), "peer_a");
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_calling_self_is_rejected() {
        let (node, _events) = PeerNode::start(
            config("peer_a"),
            Arc::new(MemoryBroker::new()),
            Arc::new(LoopbackEngine::new()),
        )
        .unwrap();
        let err = node.call(PeerId::new("peer_a")).await.unwrap_err();
        assert!(matches!(err, Error::PeerConnection(_)));
    }

    fn candidate(n: usize) -> IceCandidate {
        IceCandidate {
            sdp_mid: "0".to_string(),
            sdp_mline_index: 0,
            candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n),
        }
    }

    #[test]
    fn test_early_candidates_taken_per_sender_in_order() {
        let mut early = EarlyCandidates::new(4, Duration::from_secs(30));
        let x = PeerId::new("peer_x");
        let y = PeerId::new("peer_y");
        early.hold(x.clone(), candidate(1));
        early.hold(y.clone(), candidate(9));
        early.hold(x.clone(), candidate(2));
        assert_eq!(early.len(), 3);

        assert_eq!(early.take(&x), vec![candidate(1), candidate(2)]);
        // Other senders are forgotten once a session exists
        assert_eq!(early.len(), 0);
        assert!(early.take(&y).is_empty());
    }

    #[test]
    fn test_early_candidates_drop_oldest_when_full() {
        let mut early = EarlyCandidates::new(2, Duration::from_secs(30));
        let x = PeerId::new("peer_x");
        for n in 0..4 {
            early.hold(x.clone(), candidate(n));
        }
        assert_eq!(early.take(&x), vec![candidate(2), candidate(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_candidates_age_out() {
        let mut early = EarlyCandidates::new(4, Duration::from_secs(30));
        let x = PeerId::new("peer_x");
        early.hold(x.clone(), candidate(1));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(early.take(&x).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peers_excludes_self() {
        let broker = MemoryBroker::new();
        let engine = LoopbackEngine::new();
        let (a, _a_events) =
            PeerNode::start(config("peer_a"), Arc::new(broker.clone()), Arc::new(engine.clone()))
                .unwrap();
        let (b, _b_events) =
            PeerNode::start(config("peer_b"), Arc::new(broker.clone()), Arc::new(engine.paired()))
                .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

        let peers: Vec<PeerId> = a.peers().into_keys().collect();
        assert_eq!(peers, vec![PeerId::new("peer_b")]);
        assert!(!b.peers().contains_key(b.local_peer_id()));
    }
}
