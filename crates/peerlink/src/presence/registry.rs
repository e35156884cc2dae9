//! Heartbeat-driven peer presence registry

use crate::config::PresenceConfig;
use crate::peer_id::PeerId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Capacity of the listener broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Liveness of a peer as seen through its heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    /// Heartbeat seen within the offline threshold
    Online,
    /// Silent for longer than the offline threshold
    Stale,
    /// Silent for longer than the expire threshold; the entry is gone
    Expired,
}

/// One peer's presence record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub peer_id: PeerId,
    pub last_seen_at: Instant,
    pub state: PresenceState,
}

/// Notification sent to listeners when a peer changes state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub peer_id: PeerId,
    pub state: PresenceState,
}

/// Tracks every peer seen on the bus and ages it through
/// Online -> Stale -> Expired.
///
/// Cloning yields another handle to the same registry. All map mutations,
/// including `tick`, go through one mutex.
#[derive(Clone)]
pub struct PresenceRegistry {
    peers: Arc<Mutex<HashMap<PeerId, PresenceEntry>>>,
    events: broadcast::Sender<PresenceEvent>,
    offline_threshold: Duration,
    expire_threshold: Duration,
}

impl PresenceRegistry {
    pub fn new(config: &PresenceConfig) -> Self {
        Self::with_thresholds(config.offline_threshold(), config.expire_threshold())
    }

    pub fn with_thresholds(offline_threshold: Duration, expire_threshold: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            events,
            offline_threshold,
            expire_threshold,
        }
    }

    /// Record a heartbeat from `peer_id`.
    ///
    /// Returns true when listeners were notified, which only happens for a
    /// new peer or one that was not already Online.
    pub fn update(&self, peer_id: &PeerId) -> bool {
        self.update_at(peer_id, Instant::now())
    }

    pub fn update_at(&self, peer_id: &PeerId, now: Instant) -> bool {
        let changed = {
            let mut peers = self.peers.lock();
            match peers.get_mut(peer_id) {
                Some(entry) => {
                    // Out-of-order delivery must not move last_seen backwards
                    if now > entry.last_seen_at {
                        entry.last_seen_at = now;
                    }
                    let was_online = entry.state == PresenceState::Online;
                    entry.state = PresenceState::Online;
                    !was_online
                }
                None => {
                    peers.insert(
                        peer_id.clone(),
                        PresenceEntry {
                            peer_id: peer_id.clone(),
                            last_seen_at: now,
                            state: PresenceState::Online,
                        },
                    );
                    true
                }
            }
        };

        if changed {
            debug!(peer_id = %peer_id, "Peer online");
            self.notify(PresenceEvent {
                peer_id: peer_id.clone(),
                state: PresenceState::Online,
            });
        }
        changed
    }

    /// Age every entry; returns the transitions that were notified
    pub fn tick(&self) -> Vec<PresenceEvent> {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&self, now: Instant) -> Vec<PresenceEvent> {
        let mut transitions = Vec::new();
        {
            let mut peers = self.peers.lock();
            peers.retain(|peer_id, entry| {
                let elapsed = now.saturating_duration_since(entry.last_seen_at);
                if elapsed > self.expire_threshold {
                    transitions.push(PresenceEvent {
                        peer_id: peer_id.clone(),
                        state: PresenceState::Expired,
                    });
                    return false;
                }
                if elapsed > self.offline_threshold && entry.state == PresenceState::Online {
                    entry.state = PresenceState::Stale;
                    transitions.push(PresenceEvent {
                        peer_id: peer_id.clone(),
                        state: PresenceState::Stale,
                    });
                }
                true
            });
        }

        for event in &transitions {
            match event.state {
                PresenceState::Expired => info!(peer_id = %event.peer_id, "Peer expired"),
                _ => debug!(peer_id = %event.peer_id, "Peer stale"),
            }
            self.notify(event.clone());
        }
        transitions
    }

    /// Current peers, optionally without the local peer
    pub fn snapshot(&self, excluding: Option<&PeerId>) -> BTreeMap<PeerId, PresenceEntry> {
        self.peers
            .lock()
            .iter()
            .filter(|(id, _)| Some(*id) != excluding)
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    /// State of a single peer, if known
    pub fn state_of(&self, peer_id: &PeerId) -> Option<PresenceState> {
        self.peers.lock().get(peer_id).map(|entry| entry.state)
    }

    /// Forget a peer immediately
    pub fn remove(&self, peer_id: &PeerId) -> bool {
        let removed = self.peers.lock().remove(peer_id).is_some();
        if removed {
            self.notify(PresenceEvent {
                peer_id: peer_id.clone(),
                state: PresenceState::Expired,
            });
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Listen for presence transitions
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    /// Run `tick` every `interval` until the returned task is aborted
    pub fn spawn_ticker(&self, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.tick();
            }
        })
    }

    fn notify(&self, event: PresenceEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}
