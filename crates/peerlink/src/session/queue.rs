//! Session queues
//!
//! [`BoundedQueue`] backs both the outbound data channel queue and the
//! reconnect outbox. Overflow evicts the oldest item: these queues are
//! lossy once full, and every eviction is counted.

use crate::signaling::IceCandidate;
use crate::Result;
use std::collections::VecDeque;
use std::future::Future;
use tracing::warn;

/// FIFO with a fixed capacity and drop-oldest overflow
#[derive(Debug, Clone)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T> BoundedQueue<T> {
    /// Create a queue; a zero capacity is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    /// Append `item`, returning the evicted oldest item if the queue was full
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.dropped += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Put an item back at the head after a failed send
    pub fn push_front(&mut self, item: T) {
        if self.items.len() >= self.capacity {
            // Head is older than the tail; the tail goes
            self.items.pop_back();
            self.dropped += 1;
        }
        self.items.push_front(item);
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items evicted since creation
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..)
    }
}

#[derive(Debug)]
struct PendingCandidate {
    candidate: IceCandidate,
    requeued: bool,
}

/// Result of one [`PendingIceQueue::flush`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    /// Candidates dropped after failing twice
    pub discarded: usize,
    /// Flush stopped at a failed candidate that is waiting at the head
    pub stalled: bool,
}

/// Candidates received before the remote description was applied
#[derive(Debug, Default)]
pub struct PendingIceQueue {
    items: VecDeque<PendingCandidate>,
}

impl PendingIceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.items.push_back(PendingCandidate {
            candidate,
            requeued: false,
        });
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Apply queued candidates in arrival order.
    ///
    /// A candidate whose apply fails is put back at the head once and the
    /// flush stops there, so nothing behind it overtakes it. On its second
    /// failure it is discarded and flushing continues.
    pub async fn flush<F, Fut>(&mut self, mut apply: F) -> FlushReport
    where
        F: FnMut(IceCandidate) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut report = FlushReport::default();
        while let Some(pending) = self.items.pop_front() {
            match apply(pending.candidate.clone()).await {
                Ok(()) => report.applied += 1,
                Err(e) if !pending.requeued => {
                    warn!("ICE candidate apply failed, requeueing: {}", e);
                    self.items.push_front(PendingCandidate {
                        candidate: pending.candidate,
                        requeued: true,
                    });
                    report.stalled = true;
                    break;
                }
                Err(e) => {
                    warn!("ICE candidate failed twice, discarding: {}", e);
                    report.discarded += 1;
                }
            }
        }
        report
    }
}
