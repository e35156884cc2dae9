//! Reconnect supervisor
//!
//! Sole owner of the [`SignalingRouter`]: it is the only task that connects
//! or disconnects the broker session. It reacts to three things:
//!
//! - transport disconnects, answered with exponential backoff
//! - explicit network changes, answered with an immediate forced reconnect
//! - a periodic health probe that catches silently dead sessions
//!
//! Telemetry published while the link is down waits in a bounded outbox
//! and is replayed in order after the next successful connect.

use super::policy::{ReconnectPolicy, ReconnectState};
use crate::config::PeerLinkConfig;
use crate::session::{BoundedQueue, ConnectionHandle};
use crate::signaling::{LinkLost, SignalingRouter};
use crate::{Error, Result};
use bytes::Bytes;
use futures::future;
use std::collections::HashSet;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};

/// Broker link as seen by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    /// Waiting `delay` before attempt number `attempt`
    Reconnecting { attempt: u32, delay: Duration },
    /// Retries exhausted or no network; dormant until a network appears
    AwaitingNetwork,
    Stopped,
}

/// Result of [`SupervisorHandle::publish`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// Held in the outbox until the link is back
    Queued,
}

enum SupervisorCommand {
    NetworkAvailable(String),
    NetworkLost(String),
    Publish {
        payload: Bytes,
        reply: oneshot::Sender<PublishOutcome>,
    },
    CheckHealth,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the supervisor task
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<SupervisorCommand>,
    link_state: watch::Receiver<LinkState>,
    reconnect_state: watch::Receiver<ReconnectState>,
}

impl SupervisorHandle {
    fn send(&self, command: SupervisorCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| Error::ChannelClosed("reconnect supervisor stopped".to_string()))
    }

    /// A network interface became usable; forces an immediate reconnect
    pub fn network_available(&self, network_id: impl Into<String>) -> Result<()> {
        self.send(SupervisorCommand::NetworkAvailable(network_id.into()))
    }

    /// A network interface went away; forces an immediate reconnect
    pub fn network_lost(&self, network_id: impl Into<String>) -> Result<()> {
        self.send(SupervisorCommand::NetworkLost(network_id.into()))
    }

    /// Publish telemetry, or queue it while the link is down
    pub async fn publish(&self, payload: impl Into<Bytes>) -> Result<PublishOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(SupervisorCommand::Publish {
            payload: payload.into(),
            reply,
        })?;
        rx.await
            .map_err(|_| Error::ChannelClosed("reconnect supervisor dropped request".to_string()))
    }

    /// Run the health probe now instead of waiting for the next interval
    pub fn check_health(&self) -> Result<()> {
        self.send(SupervisorCommand::CheckHealth)
    }

    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link_state.clone()
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        *self.reconnect_state.borrow()
    }

    /// Disconnect and stop supervising
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SupervisorCommand::Shutdown { reply })?;
        rx.await
            .map_err(|_| Error::ChannelClosed("reconnect supervisor dropped request".to_string()))
    }
}

/// Supervisor task state
pub struct ReconnectSupervisor {
    router: SignalingRouter,
    connections: Option<ConnectionHandle>,
    policy: ReconnectPolicy,
    force_pause: Duration,
    telemetry_topic: String,
    outbox: BoundedQueue<Bytes>,
    attempt_count: u32,
    /// Known networks; `None` until the platform reports one
    networks: Option<HashSet<String>>,
    dormant: bool,
    link_lost: Option<LinkLost>,
    retry: Option<Pin<Box<Sleep>>>,
    link_state: watch::Sender<LinkState>,
    reconnect_state: watch::Sender<ReconnectState>,
}

impl ReconnectSupervisor {
    /// Take ownership of `router` and start connecting.
    ///
    /// With `connections` set, a network change also closes the current
    /// peer session, whose ICE paths died with the old network.
    pub fn spawn(
        router: SignalingRouter,
        config: &PeerLinkConfig,
        connections: Option<ConnectionHandle>,
    ) -> SupervisorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (link_state, link_state_rx) = watch::channel(LinkState::Connecting);
        let (reconnect_state, reconnect_state_rx) = watch::channel(ReconnectState::default());

        let supervisor = ReconnectSupervisor {
            router,
            connections,
            policy: ReconnectPolicy::from_config(&config.reconnect),
            force_pause: config.reconnect.force_reconnect_pause(),
            telemetry_topic: config.telemetry_topic.clone(),
            outbox: BoundedQueue::new(config.reconnect.outbox_capacity),
            attempt_count: 0,
            networks: None,
            dormant: false,
            link_lost: None,
            retry: None,
            link_state,
            reconnect_state,
        };

        let health_interval = config.reconnect.health_check_interval();
        tokio::spawn(supervisor.run(rx, health_interval));

        SupervisorHandle {
            tx,
            link_state: link_state_rx,
            reconnect_state: reconnect_state_rx,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SupervisorCommand>, health_interval: Duration) {
        let mut health: Interval =
            tokio::time::interval_at(Instant::now() + health_interval, health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.connect_now().await;

        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    match command {
                        SupervisorCommand::NetworkAvailable(id) => self.on_network_available(id).await,
                        SupervisorCommand::NetworkLost(id) => self.on_network_lost(id).await,
                        SupervisorCommand::Publish { payload, reply } => {
                            let outcome = self.publish(payload).await;
                            let _ = reply.send(outcome);
                        }
                        SupervisorCommand::CheckHealth => self.check_health().await,
                        SupervisorCommand::Shutdown { reply } => {
                            self.stop().await;
                            let _ = reply.send(());
                            return;
                        }
                    }
                }
                reason = wait_link_lost(&mut self.link_lost) => {
                    self.on_link_lost(reason).await;
                }
                _ = wait_retry(&mut self.retry) => {
                    self.retry = None;
                    self.on_retry_due().await;
                }
                _ = health.tick() => {
                    self.check_health().await;
                }
            }
        }

        self.stop().await;
    }

    fn network_available(&self) -> bool {
        self.networks
            .as_ref()
            .map(|networks| !networks.is_empty())
            .unwrap_or(true)
    }

    fn is_connected(&self) -> bool {
        self.link_lost.is_some() && self.router.is_connected()
    }

    fn set_link_state(&self, state: LinkState) {
        self.link_state.send_replace(state);
    }

    fn publish_reconnect_state(&self) {
        let next_delay = match *self.link_state.borrow() {
            LinkState::Reconnecting { delay, .. } => Some(delay),
            _ => None,
        };
        self.reconnect_state.send_replace(ReconnectState {
            attempt_count: self.attempt_count,
            next_delay,
            is_reconnecting: self.retry.is_some(),
        });
    }

    async fn connect_now(&mut self) {
        if self.attempt_count == 0 {
            self.set_link_state(LinkState::Connecting);
        }

        match self.router.connect().await {
            Ok(link_lost) => {
                if self.attempt_count > 0 {
                    info!("Reconnected after {} attempts", self.attempt_count);
                }
                self.link_lost = Some(link_lost);
                self.attempt_count = 0;
                self.dormant = false;
                self.retry = None;
                self.replay_outbox().await;
                self.set_link_state(LinkState::Connected);
                self.publish_reconnect_state();
            }
            Err(e) => {
                warn!("Signaling connect failed: {}", e);
                self.schedule_retry();
            }
        }
    }

    /// Arm the next backoff attempt, or go dormant
    fn schedule_retry(&mut self) {
        if self.retry.is_some() {
            return;
        }

        if !self.network_available() {
            info!("No network available, deferring reconnect");
            self.set_link_state(LinkState::AwaitingNetwork);
        } else if !self.policy.should_retry(self.attempt_count) {
            warn!(
                "Giving up after {} reconnect attempts, waiting for network change",
                self.attempt_count
            );
            self.dormant = true;
            self.set_link_state(LinkState::AwaitingNetwork);
        } else {
            self.attempt_count += 1;
            let delay = self.policy.delay_for(self.attempt_count);
            info!(
                "Reconnect attempt {}/{} in {:?}",
                self.attempt_count, self.policy.max_attempts, delay
            );
            self.retry = Some(Box::pin(tokio::time::sleep(delay)));
            self.set_link_state(LinkState::Reconnecting {
                attempt: self.attempt_count,
                delay,
            });
        }
        self.publish_reconnect_state();
    }

    async fn on_retry_due(&mut self) {
        if !self.network_available() {
            debug!("Reconnect due but no network, deferring");
            self.set_link_state(LinkState::AwaitingNetwork);
            self.publish_reconnect_state();
            return;
        }
        self.connect_now().await;
    }

    async fn on_link_lost(&mut self, reason: String) {
        warn!("Broker link lost: {}", reason);
        self.link_lost = None;
        self.router.disconnect().await;
        self.schedule_retry();
    }

    async fn on_network_available(&mut self, network_id: String) {
        let networks = self.networks.get_or_insert_with(HashSet::new);
        let is_new = networks.insert(network_id.clone());

        if !is_new && self.is_connected() {
            debug!("Network {} already known and link healthy", network_id);
            return;
        }

        info!("Network {} available, forcing reconnect", network_id);
        self.force_reconnect(true).await;
    }

    async fn on_network_lost(&mut self, network_id: String) {
        if let Some(networks) = self.networks.as_mut() {
            networks.remove(&network_id);
        } else {
            self.networks = Some(HashSet::new());
        }

        info!("Network {} lost, forcing reconnect", network_id);
        self.force_reconnect(true).await;
    }

    /// Tear down, pause briefly, reset the attempt counter and connect.
    ///
    /// The peer session is only closed when `close_peer_session` is set; a
    /// broker-only failure leaves the data channel alone.
    async fn force_reconnect(&mut self, close_peer_session: bool) {
        self.retry = None;
        self.link_lost = None;
        self.router.disconnect().await;

        if let Some(connections) = self.connections.as_ref().filter(|_| close_peer_session) {
            if let Err(e) = connections.close().await {
                debug!("Failed to close peer session on network change: {}", e);
            }
        }

        self.set_link_state(LinkState::Connecting);
        tokio::time::sleep(self.force_pause).await;

        self.attempt_count = 0;
        self.dormant = false;
        self.connect_now().await;
    }

    async fn check_health(&mut self) {
        if self.is_connected() {
            return;
        }

        if self.link_lost.is_some() {
            warn!("Health check: broker link is dead, forcing reconnect");
            self.force_reconnect(false).await;
        } else if self.retry.is_none() && !self.dormant && self.network_available() {
            info!("Health check: not connected and no retry pending, reconnecting");
            self.force_reconnect(false).await;
        }
    }

    async fn publish(&mut self, payload: Bytes) -> PublishOutcome {
        if self.is_connected() && self.outbox.is_empty() {
            let sender = self.router.sender();
            match sender.publish_raw(&self.telemetry_topic, payload.clone()).await {
                Ok(()) => return PublishOutcome::Published,
                Err(e) => {
                    warn!("Telemetry publish failed, queueing: {}", e);
                    self.enqueue(payload);
                    self.check_health().await;
                    return PublishOutcome::Queued;
                }
            }
        }

        self.enqueue(payload);
        PublishOutcome::Queued
    }

    fn enqueue(&mut self, payload: Bytes) {
        if self.outbox.push(payload).is_some() {
            warn!(
                "Outbox full ({}), dropped oldest payload ({} dropped total)",
                self.outbox.capacity(),
                self.outbox.dropped()
            );
        }
    }

    async fn replay_outbox(&mut self) {
        if self.outbox.is_empty() {
            return;
        }

        let sender = self.router.sender();
        let mut replayed = 0usize;
        while let Some(payload) = self.outbox.pop() {
            if let Err(e) = sender.publish_raw(&self.telemetry_topic, payload.clone()).await {
                warn!("Outbox replay interrupted: {}", e);
                self.outbox.push_front(payload);
                break;
            }
            replayed += 1;
        }
        info!("Replayed {} queued payloads", replayed);
    }

    async fn stop(&mut self) {
        self.retry = None;
        self.link_lost = None;
        self.router.disconnect().await;
        self.set_link_state(LinkState::Stopped);
        self.publish_reconnect_state();
        info!("Reconnect supervisor stopped");
    }
}

async fn wait_link_lost(link_lost: &mut Option<LinkLost>) -> String {
    match link_lost {
        Some(link_lost) => link_lost.await,
        None => future::pending().await,
    }
}

async fn wait_retry(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry {
        Some(sleep) => sleep.as_mut().await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_id::PeerId;
    use crate::presence::PresenceRegistry;
    use crate::session::{CallRole, ConnectionManager};
    use crate::testing::{LoopbackEngine, MemoryBroker};
    use std::sync::Arc;

    fn spawn(broker: &MemoryBroker, config: &PeerLinkConfig) -> SupervisorHandle {
        spawn_with_connections(broker, config, None)
    }

    fn spawn_with_connections(
        broker: &MemoryBroker,
        config: &PeerLinkConfig,
        connections: Option<ConnectionHandle>,
    ) -> SupervisorHandle {
        let registry = PresenceRegistry::new(&config.presence);
        let (router, _inbound) =
            SignalingRouter::new(PeerId::new("peer_sup"), config, Arc::new(broker.clone()), registry);
        ReconnectSupervisor::spawn(router, config, connections)
    }

    async fn wait_for(rx: &mut watch::Receiver<LinkState>, wanted: LinkState) {
        while *rx.borrow_and_update() != wanted {
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_on_start() {
        let broker = MemoryBroker::new();
        let handle = spawn(&broker, &PeerLinkConfig::default());
        wait_for(&mut handle.link_state(), LinkState::Connected).await;
        assert_eq!(broker.session_count(), 1);
        assert_eq!(handle.reconnect_state().attempt_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_go_dormant_until_network() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let mut config = PeerLinkConfig::default();
        config.reconnect.max_attempts = 2;
        let handle = spawn(&broker, &config);
        let mut state = handle.link_state();

        wait_for(&mut state, LinkState::AwaitingNetwork).await;
        // Initial attempt plus two retries
        assert_eq!(broker.connect_attempts(), 3);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(broker.connect_attempts(), 3);

        broker.set_reachable(true);
        handle.network_available("wifi").unwrap();
        wait_for(&mut state, LinkState::Connected).await;
        assert_eq!(handle.reconnect_state().attempt_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_deferred_without_network() {
        let broker = MemoryBroker::new();
        let handle = spawn(&broker, &PeerLinkConfig::default());
        let mut state = handle.link_state();
        wait_for(&mut state, LinkState::Connected).await;

        broker.set_reachable(false);
        handle.network_lost("wifi").unwrap();
        wait_for(&mut state, LinkState::AwaitingNetwork).await;
        let attempts = broker.connect_attempts();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(broker.connect_attempts(), attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_queues_while_down_and_replays_in_order() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let handle = spawn(&broker, &PeerLinkConfig::default());
        let mut state = handle.link_state();

        for n in 0..3 {
            let outcome = handle.publish(format!("$GPGGA,{}", n)).await.unwrap();
            assert_eq!(outcome, PublishOutcome::Queued);
        }

        broker.set_reachable(true);
        wait_for(&mut state, LinkState::Connected).await;
        assert_eq!(
            handle.publish("$GPGGA,3").await.unwrap(),
            PublishOutcome::Published
        );

        let published = broker.published("gps/demo/nmea");
        let expected: Vec<Bytes> = (0..4).map(|n| Bytes::from(format!("$GPGGA,{}", n))).collect();
        assert_eq!(published, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_catches_silent_failure() {
        let broker = MemoryBroker::new();
        let handle = spawn(&broker, &PeerLinkConfig::default());
        let mut state = handle.link_state();
        wait_for(&mut state, LinkState::Connected).await;

        // Publishes fail but the session never reports a disconnect
        broker.set_publish_failing(true);
        assert_eq!(handle.publish("$GPRMC").await.unwrap(), PublishOutcome::Queued);

        broker.set_publish_failing(false);
        tokio::time::sleep(Duration::from_secs(31)).await;
        wait_for(&mut state, LinkState::Connected).await;
        assert_eq!(broker.published("gps/demo/nmea"), vec![Bytes::from_static(b"$GPRMC")]);
        assert!(broker.connect_attempts() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_recovery_keeps_peer_session() {
        let broker = MemoryBroker::new();
        let mut config = PeerLinkConfig::default();
        config.session.channel_open_timeout_ms = 600_000;
        let (connections, _events) =
            ConnectionManager::spawn(Arc::new(LoopbackEngine::new()), config.session.clone());
        let session_id = connections
            .create_session(CallRole::Caller, PeerId::new("peer_b"))
            .await
            .unwrap();

        let handle = spawn_with_connections(&broker, &config, Some(connections.clone()));
        let mut state = handle.link_state();
        wait_for(&mut state, LinkState::Connected).await;

        broker.set_publish_failing(true);
        assert_eq!(handle.publish("$GPRMC").await.unwrap(), PublishOutcome::Queued);
        broker.set_publish_failing(false);
        tokio::time::sleep(Duration::from_secs(31)).await;
        wait_for(&mut state, LinkState::Connected).await;
        assert!(broker.connect_attempts() >= 2);

        // The broker session was rebuilt; the peer session was not touched
        let status = connections.status().await.unwrap().unwrap();
        assert_eq!(status.session_id, session_id);

        // A network change does discard it
        handle.network_available("wifi").unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(connections.status().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects() {
        let broker = MemoryBroker::new();
        let handle = spawn(&broker, &PeerLinkConfig::default());
        let mut state = handle.link_state();
        wait_for(&mut state, LinkState::Connected).await;

        handle.shutdown().await.unwrap();
        assert_eq!(*state.borrow(), LinkState::Stopped);
        assert_eq!(broker.session_count(), 0);
        assert!(handle.network_available("wifi").is_err());
    }
}
