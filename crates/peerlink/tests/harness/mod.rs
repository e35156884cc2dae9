//! PeerLink integration test harness
//!
//! Runs several [`PeerNode`]s against one in-memory broker and one loopback
//! connection network, so whole call flows can be exercised without a real
//! MQTT broker or ICE stack.
//!
//! Basic usage pattern:
//!
//! 1. Create a `TestNetwork`
//! 2. Start nodes with `network.start_node("peer_a")`
//! 3. Wait for link or session events with the `TestNode` helpers
//! 4. Call `node.shutdown()` to clean up

#![allow(dead_code)]

use peerlink::testing::{LoopbackEngine, MemoryBroker};
use peerlink::{LinkState, NodeEvent, PeerLinkConfig, PeerNode, SessionEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Event stream closed")]
    Closed,

    #[error("Node error: {0}")]
    Node(#[from] peerlink::Error),
}

/// Default wait for events in tests
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Initialize test logging (safe to call from every test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,peerlink=debug")
        .with_test_writer()
        .try_init();
}

/// Shared broker and loopback network
pub struct TestNetwork {
    pub broker: MemoryBroker,
    engine: LoopbackEngine,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            broker: MemoryBroker::new(),
            engine: LoopbackEngine::new(),
        }
    }

    pub fn start_node(&self, peer_id: &str) -> TestNode {
        self.start_node_with(PeerLinkConfig::default().with_peer_id(peer_id))
    }

    pub fn start_node_with(&self, config: PeerLinkConfig) -> TestNode {
        let engine = self.engine.paired();
        let (node, events) = PeerNode::start(
            config,
            Arc::new(self.broker.clone()),
            Arc::new(engine.clone()),
        )
        .expect("node config should be valid");
        TestNode {
            node,
            events,
            engine,
        }
    }
}

/// A running node plus its event stream
pub struct TestNode {
    pub node: PeerNode,
    pub events: mpsc::UnboundedReceiver<NodeEvent>,
    pub engine: LoopbackEngine,
}

impl TestNode {
    /// Wait for the first event matching `predicate`, discarding others
    pub async fn wait_for<F>(&mut self, what: &str, mut predicate: F) -> HarnessResult<NodeEvent>
    where
        F: FnMut(&NodeEvent) -> bool,
    {
        let events = &mut self.events;
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                match events.recv().await {
                    Some(event) if predicate(&event) => return Ok(event),
                    Some(_) => continue,
                    None => return Err(HarnessError::Closed),
                }
            }
        })
        .await
        .map_err(|_| HarnessError::Timeout(what.to_string()))?
    }

    /// Collect events matching `predicate` until `count` have arrived
    pub async fn collect<F>(
        &mut self,
        what: &str,
        count: usize,
        mut predicate: F,
    ) -> HarnessResult<Vec<NodeEvent>>
    where
        F: FnMut(&NodeEvent) -> bool,
    {
        let mut matched = Vec::with_capacity(count);
        while matched.len() < count {
            matched.push(self.wait_for(what, &mut predicate).await?);
        }
        Ok(matched)
    }

    pub async fn wait_link(&self, wanted: LinkState) -> HarnessResult<()> {
        let mut link = self.node.link_state();
        tokio::time::timeout(EVENT_TIMEOUT, async {
            while *link.borrow_and_update() != wanted {
                if link.changed().await.is_err() {
                    return Err(HarnessError::Closed);
                }
            }
            Ok(())
        })
        .await
        .map_err(|_| HarnessError::Timeout(format!("link state {:?}", wanted)))?
    }

    pub async fn wait_opened(&mut self) -> HarnessResult<NodeEvent> {
        self.wait_for("channel open", |event| {
            matches!(event, NodeEvent::Session(SessionEvent::Opened { .. }))
        })
        .await
    }

    /// Drain events already queued without waiting
    pub fn drain(&mut self) -> Vec<NodeEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    pub async fn shutdown(self) {
        let _ = self.node.shutdown().await;
    }
}

/// Text payloads of chat messages among `events`
pub fn messages(events: &[NodeEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            NodeEvent::Session(SessionEvent::Message { payload, .. }) => {
                Some(String::from_utf8_lossy(payload).into_owned())
            }
            _ => None,
        })
        .collect()
}
