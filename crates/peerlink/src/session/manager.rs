//! Connection lifecycle manager
//!
//! One actor task owns the current peer session. Handle calls and events
//! from the connection library are posted to the same command queue and
//! processed strictly in arrival order, so a remote description being
//! applied and a candidate arriving can never interleave.
//!
//! At most one session exists. Creating a session closes the previous one
//! first; events still in flight from a replaced connection carry its old
//! [`SessionId`] and are discarded.

use super::engine::{
    CallRole, DataChannelState, IceConnectionState, RtcConnection, RtcEngine, RtcEvent,
    RtcEventSink, SessionDescription, SessionId,
};
use super::queue::{BoundedQueue, PendingIceQueue};
use crate::config::SessionConfig;
use crate::peer_id::PeerId;
use crate::signaling::IceCandidate;
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Notifications from the connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Session constructed and ready for negotiation
    Ready {
        session_id: SessionId,
        role: CallRole,
        peer: PeerId,
    },
    /// Local candidate to trickle to `to`
    LocalCandidate {
        session_id: SessionId,
        to: PeerId,
        candidate: IceCandidate,
    },
    /// ICE restart offer to send to `to`
    RestartOffer {
        session_id: SessionId,
        to: PeerId,
        sdp: String,
    },
    IceStateChanged {
        session_id: SessionId,
        state: IceConnectionState,
    },
    DataChannelStateChanged {
        session_id: SessionId,
        state: DataChannelState,
    },
    /// Data channel open; queued messages have been flushed
    Opened { session_id: SessionId, peer: PeerId },
    /// Raised exactly once per session
    Closed { session_id: SessionId, peer: PeerId },
    Message {
        session_id: SessionId,
        from: PeerId,
        payload: Bytes,
    },
    /// ICE restarts exhausted; the session has been closed
    Failed {
        session_id: SessionId,
        peer: PeerId,
        reason: String,
    },
    /// Recoverable negotiation failure; recreate the session to retry
    Error { session_id: SessionId, error: String },
}

impl SessionEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            SessionEvent::Ready { session_id, .. }
            | SessionEvent::LocalCandidate { session_id, .. }
            | SessionEvent::RestartOffer { session_id, .. }
            | SessionEvent::IceStateChanged { session_id, .. }
            | SessionEvent::DataChannelStateChanged { session_id, .. }
            | SessionEvent::Opened { session_id, .. }
            | SessionEvent::Closed { session_id, .. }
            | SessionEvent::Message { session_id, .. }
            | SessionEvent::Failed { session_id, .. }
            | SessionEvent::Error { session_id, .. } => *session_id,
        }
    }
}

/// Result of [`ConnectionHandle::send_message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the data channel
    Sent,
    /// Held until the channel opens or drains
    Queued,
}

/// Snapshot of the current session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub role: CallRole,
    pub peer: PeerId,
    pub ice_state: IceConnectionState,
    pub channel_state: DataChannelState,
    pub has_remote_description: bool,
    pub pending_candidates: usize,
    pub queued_messages: usize,
    pub dropped_messages: u64,
    pub ice_restarts: u32,
}

enum Command {
    CreateSession {
        role: CallRole,
        peer: PeerId,
        reply: oneshot::Sender<Result<SessionId>>,
    },
    CreateOffer {
        session_id: SessionId,
        reply: oneshot::Sender<Result<SessionDescription>>,
    },
    CreateAnswer {
        session_id: SessionId,
        reply: oneshot::Sender<Result<SessionDescription>>,
    },
    SetRemoteDescription {
        session_id: SessionId,
        desc: SessionDescription,
        reply: oneshot::Sender<Result<()>>,
    },
    AddIceCandidate {
        session_id: SessionId,
        candidate: IceCandidate,
        reply: oneshot::Sender<Result<()>>,
    },
    SendMessage {
        payload: Bytes,
        reply: oneshot::Sender<Result<SendOutcome>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<Option<SessionStatus>>,
    },
    Engine {
        session_id: SessionId,
        event: RtcEvent,
    },
    WatchdogExpired {
        session_id: SessionId,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the connection manager task
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| Error::ChannelClosed("connection manager stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::ChannelClosed("connection manager dropped request".to_string()))
    }

    /// Tear down any existing session and build a new one for `peer`.
    ///
    /// Resolves once the connection is constructed (and, for the caller,
    /// its data channel created).
    pub async fn create_session(&self, role: CallRole, peer: PeerId) -> Result<SessionId> {
        self.request(|reply| Command::CreateSession { role, peer, reply })
            .await?
    }

    /// Create and apply a local offer
    pub async fn create_offer(&self, session_id: SessionId) -> Result<SessionDescription> {
        self.request(|reply| Command::CreateOffer { session_id, reply })
            .await?
    }

    /// Create and apply a local answer
    pub async fn create_answer(&self, session_id: SessionId) -> Result<SessionDescription> {
        self.request(|reply| Command::CreateAnswer { session_id, reply })
            .await?
    }

    /// Apply the remote description, then flush candidates received before it
    pub async fn set_remote_description(
        &self,
        session_id: SessionId,
        desc: SessionDescription,
    ) -> Result<()> {
        self.request(|reply| Command::SetRemoteDescription {
            session_id,
            desc,
            reply,
        })
        .await?
    }

    /// Apply a remote candidate, or hold it until the remote description is set
    pub async fn add_ice_candidate(
        &self,
        session_id: SessionId,
        candidate: IceCandidate,
    ) -> Result<()> {
        self.request(|reply| Command::AddIceCandidate {
            session_id,
            candidate,
            reply,
        })
        .await?
    }

    /// Send on the current session's data channel, queueing if it is not ready
    pub async fn send_message(&self, payload: impl Into<Bytes>) -> Result<SendOutcome> {
        let payload = payload.into();
        self.request(|reply| Command::SendMessage { payload, reply })
            .await?
    }

    /// Close the current session, if any. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.request(|reply| Command::Close { reply }).await
    }

    pub async fn status(&self) -> Result<Option<SessionStatus>> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Close the current session and stop the manager task
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

struct Session {
    id: SessionId,
    role: CallRole,
    peer: PeerId,
    connection: Box<dyn RtcConnection>,
    ice_state: IceConnectionState,
    channel_state: DataChannelState,
    has_remote_description: bool,
    pending_ice: PendingIceQueue,
    outbound: BoundedQueue<Bytes>,
    ice_restarts: u32,
    closed_notified: bool,
    watchdog: Option<JoinHandle<()>>,
}

impl Session {
    fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id,
            role: self.role,
            peer: self.peer.clone(),
            ice_state: self.ice_state,
            channel_state: self.channel_state,
            has_remote_description: self.has_remote_description,
            pending_candidates: self.pending_ice.len(),
            queued_messages: self.outbound.len(),
            dropped_messages: self.outbound.dropped(),
            ice_restarts: self.ice_restarts,
        }
    }

    fn disarm_watchdog(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }
}

/// Single-writer owner of the current peer session
pub struct ConnectionManager {
    engine: Arc<dyn RtcEngine>,
    config: SessionConfig,
    session: Option<Session>,
    next_session_id: u64,
    commands: mpsc::WeakUnboundedSender<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ConnectionManager {
    /// Start the manager task.
    ///
    /// The task stops on [`ConnectionHandle::shutdown`] or once every
    /// handle has been dropped.
    pub fn spawn(
        engine: Arc<dyn RtcEngine>,
        config: SessionConfig,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();

        let manager = ConnectionManager {
            engine,
            config,
            session: None,
            next_session_id: 1,
            commands: tx.downgrade(),
            events,
        };
        tokio::spawn(manager.run(rx));

        (ConnectionHandle { tx }, events_rx)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        debug!("Connection manager started");

        while let Some(command) = rx.recv().await {
            match command {
                Command::CreateSession { role, peer, reply } => {
                    let result = self.create_session(role, peer).await;
                    let _ = reply.send(result);
                }
                Command::CreateOffer { session_id, reply } => {
                    let result = self.create_local_description(session_id, false).await;
                    let _ = reply.send(result);
                }
                Command::CreateAnswer { session_id, reply } => {
                    let result = self.create_local_description(session_id, true).await;
                    let _ = reply.send(result);
                }
                Command::SetRemoteDescription {
                    session_id,
                    desc,
                    reply,
                } => {
                    let result = self.set_remote_description(session_id, desc).await;
                    let _ = reply.send(result);
                }
                Command::AddIceCandidate {
                    session_id,
                    candidate,
                    reply,
                } => {
                    let result = self.add_ice_candidate(session_id, candidate).await;
                    let _ = reply.send(result);
                }
                Command::SendMessage { payload, reply } => {
                    let result = self.send_message(payload).await;
                    let _ = reply.send(result);
                }
                Command::Close { reply } => {
                    self.teardown().await;
                    let _ = reply.send(());
                }
                Command::Status { reply } => {
                    let _ = reply.send(self.session.as_ref().map(Session::status));
                }
                Command::Engine { session_id, event } => {
                    self.handle_engine_event(session_id, event).await;
                }
                Command::WatchdogExpired { session_id } => {
                    self.handle_watchdog(session_id).await;
                }
                Command::Shutdown { reply } => {
                    self.teardown().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }

        self.teardown().await;
        debug!("Connection manager stopped");
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("Session event receiver dropped");
        }
    }

    /// Current session if it is `session_id`
    fn session_mut(&mut self, session_id: SessionId) -> Result<&mut Session> {
        match self.session.as_mut() {
            Some(session) if session.id == session_id => Ok(session),
            Some(_) => Err(Error::StaleSession(format!("{} was replaced", session_id))),
            None => Err(Error::NoActiveSession),
        }
    }

    async fn create_session(&mut self, role: CallRole, peer: PeerId) -> Result<SessionId> {
        self.teardown().await;

        let session_id = SessionId::new(self.next_session_id);
        self.next_session_id += 1;

        let commands = self.commands.clone();
        let sink = RtcEventSink::new(session_id, move |session_id, event| {
            commands
                .upgrade()
                .map(|tx| tx.send(Command::Engine { session_id, event }).is_ok())
                .unwrap_or(false)
        });

        let connection = self.engine.create_connection(role, sink).await?;

        info!(
            session_id = %session_id,
            peer_id = %peer,
            "Created {:?} session",
            role
        );

        let mut session = Session {
            id: session_id,
            role,
            peer: peer.clone(),
            connection,
            ice_state: IceConnectionState::New,
            channel_state: DataChannelState::Connecting,
            has_remote_description: false,
            pending_ice: PendingIceQueue::new(),
            outbound: BoundedQueue::new(self.config.outbound_queue_capacity),
            ice_restarts: 0,
            closed_notified: false,
            watchdog: None,
        };
        session.watchdog = Some(self.arm_watchdog(session_id));
        self.session = Some(session);

        self.emit(SessionEvent::Ready {
            session_id,
            role,
            peer,
        });
        Ok(session_id)
    }

    fn arm_watchdog(&self, session_id: SessionId) -> JoinHandle<()> {
        let commands = self.commands.clone();
        let timeout = self.config.channel_open_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::WatchdogExpired { session_id });
            }
        })
    }

    async fn create_local_description(
        &mut self,
        session_id: SessionId,
        answer: bool,
    ) -> Result<SessionDescription> {
        let session = self.session_mut(session_id)?;
        let result = if answer {
            session.connection.create_answer().await
        } else {
            session.connection.create_offer(false).await
        };

        result.map_err(|e| {
            let kind = if answer { "answer" } else { "offer" };
            error!(session_id = %session_id, "Failed to create {}: {}", kind, e);
            self.emit(SessionEvent::Error {
                session_id,
                error: e.to_string(),
            });
            e
        })
    }

    async fn set_remote_description(
        &mut self,
        session_id: SessionId,
        desc: SessionDescription,
    ) -> Result<()> {
        let session = self.session_mut(session_id)?;

        if let Err(e) = session.connection.set_remote_description(desc).await {
            error!(session_id = %session_id, "Failed to set remote description: {}", e);
            self.emit(SessionEvent::Error {
                session_id,
                error: e.to_string(),
            });
            return Err(e);
        }

        session.has_remote_description = true;
        let pending = session.pending_ice.len();
        let connection = &session.connection;
        let report = session
            .pending_ice
            .flush(|candidate| connection.add_ice_candidate(candidate))
            .await;

        debug!(
            session_id = %session_id,
            "Remote description applied, flushed {}/{} pending candidates",
            report.applied,
            pending
        );
        Ok(())
    }

    async fn add_ice_candidate(
        &mut self,
        session_id: SessionId,
        candidate: IceCandidate,
    ) -> Result<()> {
        let session = self.session_mut(session_id)?;

        // Always go through the queue so a stalled candidate is never overtaken
        session.pending_ice.push(candidate);
        if !session.has_remote_description {
            trace!(
                session_id = %session_id,
                "Holding ICE candidate until remote description ({} pending)",
                session.pending_ice.len()
            );
            return Ok(());
        }

        let connection = &session.connection;
        session
            .pending_ice
            .flush(|candidate| connection.add_ice_candidate(candidate))
            .await;
        Ok(())
    }

    /// Reapply a candidate left at the head of the queue by a failed apply.
    ///
    /// Without this the last trickled candidate would wait for a successor
    /// that may never come.
    async fn retry_stalled_candidates(&mut self, session_id: SessionId) {
        let Ok(session) = self.session_mut(session_id) else {
            return;
        };
        if !session.has_remote_description || session.pending_ice.is_empty() {
            return;
        }

        let connection = &session.connection;
        let report = session
            .pending_ice
            .flush(|candidate| connection.add_ice_candidate(candidate))
            .await;
        debug!(
            session_id = %session_id,
            "Retried stalled candidates: {} applied, {} discarded",
            report.applied,
            report.discarded
        );
    }

    async fn send_message(&mut self, payload: Bytes) -> Result<SendOutcome> {
        let high_water_mark = self.config.high_water_mark_bytes;
        let session = self.session.as_mut().ok_or(Error::NoActiveSession)?;

        if session.channel_state == DataChannelState::Open && session.outbound.is_empty() {
            let buffered = session.connection.buffered_amount().await;
            if buffered < high_water_mark {
                session.connection.send(payload).await?;
                return Ok(SendOutcome::Sent);
            }
            warn!(
                session_id = %session.id,
                "Data channel backpressured ({} bytes buffered), queueing",
                buffered
            );
        }

        if session.outbound.push(payload).is_some() {
            warn!(
                session_id = %session.id,
                "Outbound queue full, dropped oldest message ({} dropped total)",
                session.outbound.dropped()
            );
        }
        Ok(SendOutcome::Queued)
    }

    /// Drain the outbound queue in FIFO order until empty or backpressured
    async fn flush_outbound(&mut self) {
        let high_water_mark = self.config.high_water_mark_bytes;
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let mut sent = 0usize;
        while session.channel_state == DataChannelState::Open {
            if session.outbound.is_empty() {
                break;
            }
            if session.connection.buffered_amount().await >= high_water_mark {
                debug!(
                    session_id = %session.id,
                    "Flush paused on backpressure, {} messages left",
                    session.outbound.len()
                );
                break;
            }
            let Some(payload) = session.outbound.pop() else {
                break;
            };
            if let Err(e) = session.connection.send(payload.clone()).await {
                warn!(session_id = %session.id, "Flush send failed: {}", e);
                session.outbound.push_front(payload);
                break;
            }
            sent += 1;
        }

        if sent > 0 {
            debug!(session_id = %session.id, "Flushed {} queued messages", sent);
        }
    }

    async fn handle_engine_event(&mut self, session_id: SessionId, event: RtcEvent) {
        let Some(session) = self.session.as_mut() else {
            trace!(session_id = %session_id, "Dropping event for closed session");
            return;
        };
        if session.id != session_id {
            trace!(session_id = %session_id, "Dropping event from replaced session");
            return;
        }

        match event {
            RtcEvent::IceConnectionState(state) => {
                if session.ice_state == state {
                    return;
                }
                info!(session_id = %session_id, "ICE connection state: {:?}", state);
                session.ice_state = state;
                if state.is_connected() {
                    session.disarm_watchdog();
                }
                self.emit(SessionEvent::IceStateChanged { session_id, state });
                self.retry_stalled_candidates(session_id).await;

                if state == IceConnectionState::Failed {
                    self.restart_ice(session_id, "ICE connection failed").await;
                }
            }
            RtcEvent::DataChannelState(state) => {
                if session.channel_state == state {
                    return;
                }
                info!(session_id = %session_id, "Data channel state: {:?}", state);
                session.channel_state = state;
                let peer = session.peer.clone();
                self.emit(SessionEvent::DataChannelStateChanged { session_id, state });

                match state {
                    DataChannelState::Open => {
                        if let Some(session) = self.session.as_mut() {
                            session.disarm_watchdog();
                        }
                        self.flush_outbound().await;
                        self.emit(SessionEvent::Opened { session_id, peer });
                    }
                    DataChannelState::Closed => self.notify_closed(),
                    _ => {}
                }
            }
            RtcEvent::LocalCandidate(candidate) => {
                let to = session.peer.clone();
                self.emit(SessionEvent::LocalCandidate {
                    session_id,
                    to,
                    candidate,
                });
            }
            RtcEvent::Message(payload) => {
                let from = session.peer.clone();
                self.emit(SessionEvent::Message {
                    session_id,
                    from,
                    payload,
                });
            }
            RtcEvent::BufferedAmountLow => {
                self.flush_outbound().await;
            }
        }
    }

    async fn handle_watchdog(&mut self, session_id: SessionId) {
        let timeout = self.config.channel_open_timeout_ms;
        match self.session.as_ref() {
            Some(session) if session.id == session_id => {
                if session.channel_state == DataChannelState::Open {
                    return;
                }
            }
            _ => return,
        }
        warn!(
            session_id = %session_id,
            "Data channel not open after {}ms",
            timeout
        );
        self.restart_ice(session_id, "data channel open timed out").await;
    }

    /// Bounded ICE restart; past the bound the session fails and is closed
    async fn restart_ice(&mut self, session_id: SessionId, reason: &str) {
        let max_restarts = self.config.max_ice_restarts;
        let Ok(session) = self.session_mut(session_id) else {
            return;
        };

        if session.ice_restarts >= max_restarts {
            let peer = session.peer.clone();
            error!(
                session_id = %session_id,
                "{} after {} ICE restarts, giving up",
                reason,
                max_restarts
            );
            self.emit(SessionEvent::Failed {
                session_id,
                peer,
                reason: reason.to_string(),
            });
            self.teardown().await;
            return;
        }

        session.ice_restarts += 1;
        let attempt = session.ice_restarts;
        let role = session.role;
        let peer = session.peer.clone();
        session.disarm_watchdog();
        let watchdog = self.arm_watchdog(session_id);
        let Ok(session) = self.session_mut(session_id) else {
            watchdog.abort();
            return;
        };
        session.watchdog = Some(watchdog);

        warn!(
            session_id = %session_id,
            "{}, ICE restart {}/{}",
            reason,
            attempt,
            max_restarts
        );

        // The callee waits for the caller's restart offer
        if role != CallRole::Caller {
            return;
        }

        let result = session.connection.create_offer(true).await;
        match result {
            Ok(offer) => self.emit(SessionEvent::RestartOffer {
                session_id,
                to: peer,
                sdp: offer.sdp,
            }),
            Err(e) => {
                error!(session_id = %session_id, "Failed to create ICE restart offer: {}", e);
                self.emit(SessionEvent::Error {
                    session_id,
                    error: e.to_string(),
                });
            }
        }
    }

    fn notify_closed(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.closed_notified {
            return;
        }
        session.closed_notified = true;
        let event = SessionEvent::Closed {
            session_id: session.id,
            peer: session.peer.clone(),
        };
        self.emit(event);
    }

    /// Close and forget the current session. Idempotent.
    async fn teardown(&mut self) {
        self.notify_closed();
        let Some(mut session) = self.session.take() else {
            return;
        };

        session.disarm_watchdog();
        let dropped = session.outbound.len();
        session.outbound.clear();
        session.pending_ice.clear();

        if let Err(e) = session.connection.close().await {
            warn!(session_id = %session.id, "Error closing connection: {}", e);
        }

        if dropped > 0 {
            warn!(
                session_id = %session.id,
                "Discarded {} unsent messages on close",
                dropped
            );
        }
        info!(session_id = %session.id, peer_id = %session.peer, "Session closed");
    }
}
