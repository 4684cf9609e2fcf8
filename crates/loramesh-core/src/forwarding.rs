//! Forwarding queue and duplicate suppression.
//!
//! Packets accepted for relay pass through a bounded FIFO; once transmitted,
//! their dedup keys move into a bounded history ring so later copies of the
//! same message are recognized and dropped. TTL is decremented exactly once
//! per hop, at enqueue time.

use crate::error::{MeshError, MeshResult};
use crate::packet::{DedupKey, Packet};
use std::collections::VecDeque;
use tracing::trace;

/// Bounded to-forward queue plus forwarded-history ring.
#[derive(Debug)]
pub struct ForwardingEngine {
    queue: VecDeque<Packet>,
    history: VecDeque<DedupKey>,
    queue_capacity: usize,
    history_capacity: usize,
}

impl ForwardingEngine {
    pub fn new(queue_capacity: usize, history_capacity: usize) -> Self {
        ForwardingEngine {
            queue: VecDeque::with_capacity(queue_capacity),
            history: VecDeque::with_capacity(history_capacity),
            queue_capacity,
            history_capacity,
        }
    }

    /// Accept a packet for relay.
    ///
    /// Rejections, in order: queue at capacity, duplicate of a forwarded or
    /// queued packet, arriving TTL too low to relay. On success the TTL has
    /// been decremented and the packet queued.
    pub fn enqueue(&mut self, mut packet: Packet) -> MeshResult<()> {
        if self.queue.len() >= self.queue_capacity {
            return Err(MeshError::ForwardBufferFull);
        }
        let key = packet.dedup_key();
        if self.history.contains(&key) || self.queue.iter().any(|p| p.dedup_key() == key) {
            return Err(MeshError::DuplicatePacket);
        }
        if packet.ttl <= 1 {
            return Err(MeshError::TtlExpired);
        }
        packet.ttl -= 1;
        trace!(kind = %packet.kind, seq = packet.seq, ttl = packet.ttl, "queued for forwarding");
        self.queue.push_back(packet);
        Ok(())
    }

    /// Oldest queued packet, ready for transmission.
    pub fn pop_next(&mut self) -> Option<Packet> {
        self.queue.pop_front()
    }

    /// Record a transmitted (or deliberately abandoned) relay so later
    /// copies are suppressed; the oldest history entry is evicted on
    /// overflow.
    pub fn mark_forwarded(&mut self, packet: &Packet) {
        if self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(packet.dedup_key());
    }

    /// Whether a copy of this packet was already forwarded or is queued.
    pub fn seen(&self, key: &DedupKey) -> bool {
        self.history.contains(key) || self.queue.iter().any(|p| p.dedup_key() == *key)
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}
