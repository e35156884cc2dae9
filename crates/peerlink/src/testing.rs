//! In-memory doubles for the transport and connection seams
//!
//! [`MemoryBroker`] is a topic-exact pub/sub broker whose sessions can be
//! dropped or refused on demand. [`LoopbackEngine`] pairs connections that
//! exchanged each other's descriptions and moves data channel messages
//! between them without any networking.

use crate::session::engine::{
    CallRole, DataChannelState, IceConnectionState, RtcConnection, RtcEngine, RtcEvent,
    RtcEventSink, SdpKind, SessionDescription, SessionId,
};
use crate::signaling::transport::{Publisher, Transport, TransportEvent, TransportLink};
use crate::signaling::IceCandidate;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

// ============================================================================
// MemoryBroker
// ============================================================================

struct BrokerSession {
    subscriptions: Vec<String>,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct BrokerState {
    sessions: HashMap<u64, BrokerSession>,
    next_session: u64,
    reachable: bool,
    publish_failing: bool,
    connect_attempts: usize,
    published: Vec<(String, Bytes)>,
}

/// Shared in-memory broker; clones are handles to the same broker
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                reachable: true,
                ..Default::default()
            })),
        }
    }

    /// Refuse (false) or accept (true) new connections
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Make every publish fail without dropping sessions
    pub fn set_publish_failing(&self, failing: bool) {
        self.state.lock().publish_failing = failing;
    }

    /// End every session with a `Disconnected` event
    pub fn drop_all_sessions(&self, reason: &str) {
        let sessions: Vec<_> = self.state.lock().sessions.drain().collect();
        for (_, session) in sessions {
            let _ = session.tx.send(TransportEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Connect calls seen, successful or not
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    /// Payloads accepted on `topic`, in publish order
    pub fn published(&self, topic: &str) -> Vec<Bytes> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Deliver a message to subscribers as if some client published it
    pub fn inject(&self, topic: &str, payload: Bytes) {
        let state = self.state.lock();
        deliver(&state, topic, &payload);
    }
}

fn deliver(state: &BrokerState, topic: &str, payload: &Bytes) {
    for session in state.sessions.values() {
        if session.subscriptions.iter().any(|s| s == topic) {
            let _ = session.tx.send(TransportEvent::Message {
                topic: topic.to_string(),
                payload: payload.clone(),
            });
        }
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self, subscriptions: &[String]) -> Result<TransportLink> {
        let (tx, events) = mpsc::unbounded_channel();
        let session_id = {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            if !state.reachable {
                return Err(Error::Transport("broker unreachable".to_string()));
            }
            state.next_session += 1;
            let session_id = state.next_session;
            state.sessions.insert(
                session_id,
                BrokerSession {
                    subscriptions: subscriptions.to_vec(),
                    tx,
                },
            );
            session_id
        };

        Ok(TransportLink {
            publisher: Arc::new(MemoryPublisher {
                broker: self.clone(),
                session_id,
            }),
            events,
        })
    }
}

struct MemoryPublisher {
    broker: MemoryBroker,
    session_id: u64,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let mut state = self.broker.state.lock();
        if !state.sessions.contains_key(&self.session_id) {
            return Err(Error::Transport("session closed".to_string()));
        }
        if state.publish_failing {
            return Err(Error::Transport("publish rejected".to_string()));
        }
        state.published.push((topic.to_string(), payload.clone()));
        deliver(&state, topic, &payload);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.broker.state.lock().sessions.remove(&self.session_id);
        Ok(())
    }
}

// ============================================================================
// LoopbackEngine
// ============================================================================

const UID_ATTRIBUTE: &str = "a=loopback-uid:";

#[derive(Default)]
struct Network {
    connections: Mutex<HashMap<u64, Weak<LoopbackConnection>>>,
    next_uid: AtomicU64,
}

#[derive(Default)]
struct EngineShared {
    connections: Mutex<HashMap<SessionId, Arc<LoopbackConnection>>>,
    buffered_amount: AtomicUsize,
    fail_next_offer: AtomicBool,
    fail_next_candidate: AtomicBool,
}

/// Connection engine that links peers in memory.
///
/// Engines created with [`LoopbackEngine::paired`] share one network so two
/// nodes can negotiate with each other.
#[derive(Clone, Default)]
pub struct LoopbackEngine {
    network: Arc<Network>,
    shared: Arc<EngineShared>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Another engine on the same loopback network
    pub fn paired(&self) -> Self {
        Self {
            network: self.network.clone(),
            shared: Arc::new(EngineShared::default()),
        }
    }

    /// Buffered amount reported by every connection of this engine
    pub fn set_buffered_amount(&self, bytes: usize) {
        self.shared.buffered_amount.store(bytes, Ordering::SeqCst);
    }

    /// Zero the buffered amount and raise `BufferedAmountLow` on open channels
    pub fn drain_buffers(&self) {
        self.set_buffered_amount(0);
        for connection in self.shared.connections.lock().values() {
            if connection.state.lock().channel_open {
                connection.sink.emit(RtcEvent::BufferedAmountLow);
            }
        }
    }

    pub fn fail_next_offer(&self) {
        self.shared.fail_next_offer.store(true, Ordering::SeqCst);
    }

    /// Reject the next remote candidate applied on any connection
    pub fn fail_next_candidate(&self) {
        self.shared.fail_next_candidate.store(true, Ordering::SeqCst);
    }

    /// Report ICE failure on the connection of `session_id`
    pub fn fail_ice(&self, session_id: SessionId) {
        self.report(session_id, RtcEvent::IceConnectionState(IceConnectionState::Failed));
    }

    /// Raise a data channel state change on `session_id` without touching
    /// the connection itself
    pub fn report_channel_state(&self, session_id: SessionId, state: DataChannelState) {
        self.report(session_id, RtcEvent::DataChannelState(state));
    }

    fn report(&self, session_id: SessionId, event: RtcEvent) {
        if let Some(connection) = self.connection(session_id) {
            connection.sink.emit(event);
        }
    }

    /// Remote candidates applied to the connection of `session_id`
    pub fn applied_candidates(&self, session_id: SessionId) -> Vec<IceCandidate> {
        self.connection(session_id)
            .map(|c| c.state.lock().applied.clone())
            .unwrap_or_default()
    }

    /// Payloads sent over the data channel of `session_id`
    pub fn sent_messages(&self, session_id: SessionId) -> Vec<Bytes> {
        self.connection(session_id)
            .map(|c| c.state.lock().sent.clone())
            .unwrap_or_default()
    }

    pub fn is_closed(&self, session_id: SessionId) -> bool {
        self.connection(session_id)
            .map(|c| c.state.lock().closed)
            .unwrap_or(false)
    }

    fn connection(&self, session_id: SessionId) -> Option<Arc<LoopbackConnection>> {
        self.shared.connections.lock().get(&session_id).cloned()
    }
}

#[async_trait]
impl RtcEngine for LoopbackEngine {
    async fn create_connection(
        &self,
        role: CallRole,
        sink: RtcEventSink,
    ) -> Result<Box<dyn RtcConnection>> {
        let uid = self.network.next_uid.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = Arc::new(LoopbackConnection {
            uid,
            role,
            sink: sink.clone(),
            network: self.network.clone(),
            shared: self.shared.clone(),
            state: Mutex::new(ConnectionState::default()),
        });

        self.network
            .connections
            .lock()
            .insert(uid, Arc::downgrade(&connection));
        self.shared
            .connections
            .lock()
            .insert(sink.session_id(), connection.clone());

        Ok(Box::new(LoopbackHandle(connection)))
    }
}

#[derive(Default)]
struct ConnectionState {
    local: Option<SdpKind>,
    remote_uid: Option<u64>,
    local_version: u32,
    applied: Vec<IceCandidate>,
    sent: Vec<Bytes>,
    channel_open: bool,
    ice_connected: bool,
    closed: bool,
}

struct LoopbackConnection {
    uid: u64,
    role: CallRole,
    sink: RtcEventSink,
    network: Arc<Network>,
    shared: Arc<EngineShared>,
    state: Mutex<ConnectionState>,
}

impl LoopbackConnection {
    fn sdp(&self, kind: SdpKind, version: u32, ice_restart: bool) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n{}{}\r\na=setup:{}\r\n",
            self.uid,
            version,
            UID_ATTRIBUTE,
            self.uid,
            match kind {
                SdpKind::Offer => "actpass",
                SdpKind::Answer => "active",
            }
        );
        if ice_restart {
            sdp.push_str("a=ice-options:restart\r\n");
        }
        sdp
    }

    fn gather_candidates(&self, version: u32) {
        for component in 1..=2 {
            self.sink.emit(RtcEvent::LocalCandidate(IceCandidate {
                sdp_mid: "0".to_string(),
                sdp_mline_index: 0,
                candidate: format!(
                    "candidate:{}{}{} {} udp 2122260223 127.0.0.1 {} typ host",
                    self.uid,
                    version,
                    component,
                    component,
                    40000 + self.uid * 10 + component
                ),
            }));
        }
    }

    fn remote(&self) -> Option<Arc<LoopbackConnection>> {
        let remote_uid = self.state.lock().remote_uid?;
        self.network
            .connections
            .lock()
            .get(&remote_uid)
            .and_then(Weak::upgrade)
    }

    /// Connect both ends once each has the other's description
    fn try_connect(&self) {
        let Some(remote) = self.remote() else {
            return;
        };
        // One lock at a time: the other end may be checking us concurrently
        let local_ready = {
            let local = self.state.lock();
            local.local.is_some() && !local.closed
        };
        let remote_ready = {
            let other = remote.state.lock();
            other.local.is_some() && other.remote_uid == Some(self.uid) && !other.closed
        };
        if !(local_ready && remote_ready) {
            return;
        }
        for connection in [self, remote.as_ref()] {
            connection.establish();
        }
    }

    fn establish(&self) {
        let open_channel = {
            let mut state = self.state.lock();
            state.ice_connected = true;
            let open = !state.channel_open;
            state.channel_open = true;
            open
        };
        self.sink
            .emit(RtcEvent::IceConnectionState(IceConnectionState::Checking));
        self.sink
            .emit(RtcEvent::IceConnectionState(IceConnectionState::Connected));
        if open_channel {
            self.sink
                .emit(RtcEvent::DataChannelState(DataChannelState::Open));
        }
    }

    fn shut_channel(&self) {
        let was_open = {
            let mut state = self.state.lock();
            let was_open = state.channel_open;
            state.channel_open = false;
            state.ice_connected = false;
            was_open
        };
        if was_open {
            self.sink
                .emit(RtcEvent::DataChannelState(DataChannelState::Closing));
            self.sink
                .emit(RtcEvent::DataChannelState(DataChannelState::Closed));
        }
    }
}

fn uid_from_sdp(sdp: &str) -> Option<u64> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix(UID_ATTRIBUTE))
        .and_then(|uid| uid.trim().parse().ok())
}

struct LoopbackHandle(Arc<LoopbackConnection>);

#[async_trait]
impl RtcConnection for LoopbackHandle {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let connection = &self.0;
        if connection.shared.fail_next_offer.swap(false, Ordering::SeqCst) {
            return Err(Error::Sdp("Failed to create offer: injected failure".to_string()));
        }
        if connection.role == CallRole::Callee && !ice_restart {
            return Err(Error::Sdp("Callee has no data channel to offer".to_string()));
        }
        let version = {
            let mut state = connection.state.lock();
            if state.closed {
                return Err(Error::PeerConnection("connection closed".to_string()));
            }
            state.local = Some(SdpKind::Offer);
            state.local_version += 1;
            state.local_version
        };
        connection.gather_candidates(version);
        Ok(SessionDescription::offer(connection.sdp(SdpKind::Offer, version, ice_restart)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let connection = &self.0;
        let version = {
            let mut state = connection.state.lock();
            if state.remote_uid.is_none() {
                return Err(Error::Sdp("No remote offer to answer".to_string()));
            }
            state.local = Some(SdpKind::Answer);
            state.local_version += 1;
            state.local_version
        };
        connection.gather_candidates(version);
        let answer = SessionDescription::answer(connection.sdp(SdpKind::Answer, version, false));
        connection.try_connect();
        Ok(answer)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let connection = &self.0;
        let uid = uid_from_sdp(&desc.sdp)
            .ok_or_else(|| Error::Sdp("Failed to parse remote description".to_string()))?;
        {
            let mut state = connection.state.lock();
            if state.closed {
                return Err(Error::PeerConnection("connection closed".to_string()));
            }
            state.remote_uid = Some(uid);
        }
        if desc.kind == SdpKind::Answer {
            connection.try_connect();
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.0.shared.fail_next_candidate.swap(false, Ordering::SeqCst) {
            return Err(Error::IceCandidate("injected failure".to_string()));
        }
        let mut state = self.0.state.lock();
        if state.remote_uid.is_none() {
            return Err(Error::IceCandidate(
                "remote description not set".to_string(),
            ));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        let connection = &self.0;
        {
            let mut state = connection.state.lock();
            if !state.channel_open {
                return Err(Error::DataChannel("data channel not open".to_string()));
            }
            state.sent.push(payload.clone());
        }
        if let Some(remote) = connection.remote() {
            remote.sink.emit(RtcEvent::Message(payload));
        }
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.0.shared.buffered_amount.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        let connection = &self.0;
        {
            let mut state = connection.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }
        connection.shut_channel();
        if let Some(remote) = connection.remote() {
            let remote_points_here = remote.state.lock().remote_uid == Some(connection.uid);
            if remote_points_here {
                remote.shut_channel();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(id: u64) -> (RtcEventSink, Arc<Mutex<Vec<RtcEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        let sink = RtcEventSink::new(SessionId::new(id), move |_, event| {
            captured.lock().push(event);
            true
        });
        (sink, events)
    }

    #[tokio::test]
    async fn test_broker_delivers_to_subscribers() {
        let broker = MemoryBroker::new();
        let mut a = broker.connect(&["chat".to_string()]).await.unwrap();
        let b = broker.connect(&["other".to_string()]).await.unwrap();

        b.publisher
            .publish("chat", Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert_eq!(
            a.events.recv().await.unwrap(),
            TransportEvent::Message {
                topic: "chat".to_string(),
                payload: Bytes::from_static(b"hi")
            }
        );
        assert_eq!(broker.published("chat").len(), 1);
    }

    #[tokio::test]
    async fn test_broker_drop_and_refuse() {
        let broker = MemoryBroker::new();
        let mut a = broker.connect(&[]).await.unwrap();
        broker.drop_all_sessions("gone");
        assert!(matches!(
            a.events.recv().await,
            Some(TransportEvent::Disconnected { .. })
        ));
        assert!(a.publisher.publish("t", Bytes::new()).await.is_err());

        broker.set_reachable(false);
        assert!(broker.connect(&[]).await.is_err());
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_loopback_pair_opens_and_exchanges() {
        let caller_engine = LoopbackEngine::new();
        let callee_engine = caller_engine.paired();
        let (caller_sink, caller_events) = sink(1);
        let (callee_sink, callee_events) = sink(1);

        let caller = caller_engine
            .create_connection(CallRole::Caller, caller_sink)
            .await
            .unwrap();
        let callee = callee_engine
            .create_connection(CallRole::Callee, callee_sink)
            .await
            .unwrap();

        let offer = caller.create_offer(false).await.unwrap();
        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        caller.set_remote_description(answer).await.unwrap();

        for events in [&caller_events, &callee_events] {
            assert!(events
                .lock()
                .contains(&RtcEvent::DataChannelState(DataChannelState::Open)));
        }

        caller.send(Bytes::from_static(b"hello")).await.unwrap();
        assert!(callee_events
            .lock()
            .contains(&RtcEvent::Message(Bytes::from_static(b"hello"))));

        caller.close().await.unwrap();
        assert!(callee_events
            .lock()
            .contains(&RtcEvent::DataChannelState(DataChannelState::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_connect_checks_do_not_deadlock() {
        let caller_engine = LoopbackEngine::new();
        let callee_engine = caller_engine.paired();
        let (caller_sink, _) = sink(1);
        let (callee_sink, _) = sink(1);
        let caller = caller_engine
            .create_connection(CallRole::Caller, caller_sink)
            .await
            .unwrap();
        let callee = callee_engine
            .create_connection(CallRole::Callee, callee_sink)
            .await
            .unwrap();
        let offer = caller.create_offer(false).await.unwrap();
        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        caller.set_remote_description(answer).await.unwrap();

        let ends = [
            caller_engine.connection(SessionId::new(1)).unwrap(),
            callee_engine.connection(SessionId::new(1)).unwrap(),
        ];
        let checks = ends.map(|end| {
            tokio::task::spawn_blocking(move || {
                for _ in 0..2_000 {
                    end.try_connect();
                }
            })
        });

        let finished = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            for check in checks {
                check.await.unwrap();
            }
        })
        .await;
        assert!(finished.is_ok());
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_rejected() {
        let engine = LoopbackEngine::new();
        let (sink, _) = sink(1);
        let connection = engine.create_connection(CallRole::Callee, sink).await.unwrap();
        let candidate = IceCandidate {
            sdp_mid: "0".to_string(),
            sdp_mline_index: 0,
            candidate: "candidate:1".to_string(),
        };
        assert!(connection.add_ice_candidate(candidate).await.is_err());
    }
}
